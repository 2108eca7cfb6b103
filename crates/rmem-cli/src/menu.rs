//! Interactive menus.
//!
//! Navigation is a pure function from the current page and one line of
//! input to the next page and the action to run, so it can be tested
//! without a terminal or a connection.

/// Client menu page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    /// Operations against the server region and the directory
    Main,
    /// Operations against a directory entry
    Peers,
}

/// What the client loop should do for one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the session
    Disconnect,
    /// Inline write to the server region
    WriteInline,
    /// Write to the server region
    Write,
    /// Read from the server region
    Read,
    /// Advertise our region as open
    OpenRegion,
    /// Withdraw our region
    CloseRegion,
    /// List directory entries
    ViewDirectory,
    /// Register and fetch other regions
    RequestRegions,
    /// Inline write to a directory entry
    WriteInlineTo,
    /// Write to a directory entry
    WriteTo,
    /// Read from a directory entry
    ReadFrom,
    /// Only the page changed
    Navigate,
    /// Input named no option
    Invalid,
}

/// Next page and action for `input` on `page`.
///
/// The peers page is reachable only while the directory holds entries.
#[must_use]
pub fn step(page: Page, input: &str, directory_empty: bool) -> (Page, Action) {
    let choice = input.trim();
    match page {
        Page::Main => match choice {
            "1" => (Page::Main, Action::Disconnect),
            "2" => (Page::Main, Action::WriteInline),
            "3" => (Page::Main, Action::Write),
            "4" => (Page::Main, Action::Read),
            "5" => (Page::Main, Action::OpenRegion),
            "6" => (Page::Main, Action::CloseRegion),
            "7" => (Page::Main, Action::ViewDirectory),
            "8" => (Page::Main, Action::RequestRegions),
            "9" if !directory_empty => (Page::Peers, Action::Navigate),
            _ => (Page::Main, Action::Invalid),
        },
        Page::Peers => match choice {
            "1" => (Page::Peers, Action::WriteInlineTo),
            "2" => (Page::Peers, Action::WriteTo),
            "3" => (Page::Peers, Action::ReadFrom),
            "4" => (Page::Main, Action::Navigate),
            _ => (Page::Peers, Action::Invalid),
        },
    }
}

/// Menu text for `page`
#[must_use]
pub fn render(page: Page, directory_empty: bool) -> String {
    let mut text = String::new();
    match page {
        Page::Main => {
            text.push_str("\n== rmem client ==\n");
            text.push_str("  1) disconnect\n");
            text.push_str("  2) write inline\n");
            text.push_str("  3) write\n");
            text.push_str("  4) read\n");
            text.push_str("  5) open region\n");
            text.push_str("  6) close region\n");
            text.push_str("  7) view directory\n");
            text.push_str("  8) request regions\n");
            if !directory_empty {
                text.push_str("  9) peer regions\n");
            }
        }
        Page::Peers => {
            text.push_str("\n== peer regions ==\n");
            text.push_str("  1) write inline\n");
            text.push_str("  2) write\n");
            text.push_str("  3) read\n");
            text.push_str("  4) back\n");
        }
    }
    text
}

/// What the server loop should do for one input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerAction {
    /// Stop the server
    Shutdown,
    /// List connected clients
    ViewClients,
    /// Input named no option
    Invalid,
}

/// Server menu choice for `input`
#[must_use]
pub fn server_step(input: &str) -> ServerAction {
    match input.trim() {
        "1" => ServerAction::Shutdown,
        "2" => ServerAction::ViewClients,
        _ => ServerAction::Invalid,
    }
}

/// Server menu text
pub const SERVER_MENU: &str = "\n== rmem server ==\n  1) shut down\n  2) view connected clients\n";

/// Space-separated lowercase hex, as read results are shown
#[must_use]
pub fn format_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| hex::encode([*b]))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Format bytes in human-readable format
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    format!("{size:.2} {}", UNITS[unit_idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_page_actions() {
        assert_eq!(step(Page::Main, "1", true), (Page::Main, Action::Disconnect));
        assert_eq!(step(Page::Main, " 4\n", true), (Page::Main, Action::Read));
        assert_eq!(
            step(Page::Main, "8", true),
            (Page::Main, Action::RequestRegions)
        );
        assert_eq!(step(Page::Main, "x", false), (Page::Main, Action::Invalid));
    }

    #[test]
    fn test_peer_page_needs_entries() {
        assert_eq!(step(Page::Main, "9", true), (Page::Main, Action::Invalid));
        assert_eq!(step(Page::Main, "9", false), (Page::Peers, Action::Navigate));
        assert!(!render(Page::Main, true).contains("9)"));
        assert!(render(Page::Main, false).contains("9) peer regions"));
    }

    #[test]
    fn test_peer_page_actions() {
        assert_eq!(
            step(Page::Peers, "3", false),
            (Page::Peers, Action::ReadFrom)
        );
        assert_eq!(step(Page::Peers, "4", false), (Page::Main, Action::Navigate));
        assert_eq!(step(Page::Peers, "9", false), (Page::Peers, Action::Invalid));
    }

    #[test]
    fn test_server_menu() {
        assert_eq!(server_step("1"), ServerAction::Shutdown);
        assert_eq!(server_step("2\n"), ServerAction::ViewClients);
        assert_eq!(server_step(""), ServerAction::Invalid);
    }

    #[test]
    fn test_format_hex() {
        assert_eq!(format_hex(b"hello"), "68 65 6c 6c 6f");
        assert_eq!(format_hex(&[]), "");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(65536), "64.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
    }
}
