//! Prompt loops for the client and server menus.

use crate::menu::{self, Action, Page, ServerAction};
use rmem_core::{Client, PeerId, Server, SessionError};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::str::FromStr;

/// Line-oriented terminal, generic so tests can script it.
pub struct Console<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Console<R, W> {
    /// Wrap an input and an output stream
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    /// Print `text` as is
    ///
    /// # Errors
    ///
    /// Returns the write failure.
    pub fn say(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes())?;
        self.output.flush()
    }

    /// Prompt for one line; `None` at end of input
    ///
    /// # Errors
    ///
    /// Returns the read or write failure.
    pub fn line(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.say(prompt)?;
        let mut buf = String::new();
        if self.input.read_line(&mut buf)? == 0 {
            return Ok(None);
        }
        Ok(Some(buf.trim_end_matches(['\r', '\n']).to_string()))
    }

    /// Prompt until the answer parses; `None` at end of input
    ///
    /// # Errors
    ///
    /// Returns the read or write failure.
    pub fn number<T: FromStr>(&mut self, prompt: &str) -> io::Result<Option<T>> {
        loop {
            let Some(answer) = self.line(prompt)? else {
                return Ok(None);
            };
            match answer.trim().parse() {
                Ok(value) => return Ok(Some(value)),
                Err(_) => self.say("not a number\n")?,
            }
        }
    }

    /// Prompt for a peer id, decimal or `0x` hex
    ///
    /// # Errors
    ///
    /// Returns the read or write failure.
    pub fn peer_id(&mut self, prompt: &str) -> io::Result<Option<PeerId>> {
        loop {
            let Some(answer) = self.line(prompt)? else {
                return Ok(None);
            };
            match parse_peer_id(&answer) {
                Some(id) => return Ok(Some(id)),
                None => self.say("not a peer id\n")?,
            }
        }
    }
}

/// Parse a decimal or `0x`-prefixed hex peer id
#[must_use]
pub fn parse_peer_id(text: &str) -> Option<PeerId> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(digits, 16).ok(),
        None => text.parse().ok(),
    }
}

/// Print the outcome of an operation. Recoverable errors are shown and the
/// menu continues; a closed session is reported; anything else ends the loop.
fn report<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    result: rmem_core::Result<()>,
    done: &str,
) -> anyhow::Result<()> {
    match result {
        Ok(()) => console.say(&format!("{done}\n"))?,
        Err(SessionError::Closed) => console.say("session closed\n")?,
        Err(e) if e.is_recoverable() => console.say(&format!("error: {e}\n"))?,
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Show read bytes as hex, on the console or appended to a file
fn deliver<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    bytes: &[u8],
) -> anyhow::Result<()> {
    let text = menu::format_hex(bytes);
    let choice = console.line("output to (c)onsole or (f)ile? ")?;
    if choice.as_deref().map(str::trim) == Some("f") {
        let Some(path) = console.line("file: ")? else {
            return Ok(());
        };
        let path = PathBuf::from(path.trim());
        fs::write(&path, format!("{text}\n"))?;
        console.say(&format!("{} bytes written to {}\n", bytes.len(), path.display()))?;
    } else {
        console.say(&format!("{text}\n"))?;
    }
    Ok(())
}

fn read_result<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    result: rmem_core::Result<Vec<u8>>,
) -> anyhow::Result<()> {
    match result {
        Ok(bytes) => deliver(console, &bytes),
        Err(e) => report(console, Err(e), ""),
    }
}

fn show_directory<R: BufRead, W: Write>(
    console: &mut Console<R, W>,
    client: &Client,
) -> io::Result<()> {
    let entries = client.directory().snapshot();
    if entries.is_empty() {
        return console.say("directory is empty\n");
    }
    for entry in entries {
        console.say(&format!(
            "  {:#018x}  {:>10}  addr {:#x}  rkey {:#x}  {}\n",
            entry.id,
            menu::format_bytes(entry.length),
            entry.addr,
            entry.rkey,
            entry.status
        ))?;
    }
    Ok(())
}

/// Drive the client menu until the user disconnects or the server goes away
///
/// # Errors
///
/// Returns terminal failures and fatal session errors.
pub fn run_client<R: BufRead, W: Write>(
    client: &Client,
    console: &mut Console<R, W>,
) -> anyhow::Result<()> {
    console.say(&format!(
        "connected as peer {:#018x}, server region {}\n",
        client.peer_id(),
        menu::format_bytes(client.server_target()?.length)
    ))?;

    let mut page = Page::Main;
    loop {
        if client.session().is_torn_down() {
            console.say("server closed the session\n")?;
            break;
        }
        let empty = client.directory().is_empty();
        if empty {
            page = Page::Main;
        }
        console.say(&menu::render(page, empty))?;

        let Some(input) = console.line("> ")? else {
            client.disconnect()?;
            break;
        };
        let (next, action) = menu::step(page, &input, empty);
        page = next;

        match action {
            Action::Disconnect => {
                client.disconnect()?;
                console.say("disconnected\n")?;
                break;
            }
            Action::WriteInline | Action::Write => {
                let Some(offset) = console.number::<u64>("offset: ")? else { continue };
                let Some(text) = console.line("data: ")? else { continue };
                let result = if action == Action::WriteInline {
                    client.write_inline(offset, text.as_bytes())
                } else {
                    client.write(offset, text.as_bytes())
                };
                report(console, result, "written")?;
            }
            Action::Read => {
                let Some(offset) = console.number::<u64>("offset: ")? else { continue };
                let Some(len) = console.number::<usize>("length: ")? else { continue };
                read_result(console, client.read(offset, len))?;
            }
            Action::OpenRegion => report(console, client.open_region(), "region open")?,
            Action::CloseRegion => report(console, client.close_region(), "region closed")?,
            Action::ViewDirectory => show_directory(console, client)?,
            Action::RequestRegions => {
                let result = client.request_regions();
                report(console, result, "directory updated")?;
                show_directory(console, client)?;
            }
            Action::WriteInlineTo | Action::WriteTo => {
                show_directory(console, client)?;
                let Some(peer) = console.peer_id("peer id: ")? else { continue };
                let Some(offset) = console.number::<u64>("offset: ")? else { continue };
                let Some(text) = console.line("data: ")? else { continue };
                let result = if action == Action::WriteInlineTo {
                    client.write_inline_to(peer, offset, text.as_bytes())
                } else {
                    client.write_to(peer, offset, text.as_bytes())
                };
                report(console, result, "written")?;
            }
            Action::ReadFrom => {
                show_directory(console, client)?;
                let Some(peer) = console.peer_id("peer id: ")? else { continue };
                let Some(offset) = console.number::<u64>("offset: ")? else { continue };
                let Some(len) = console.number::<usize>("length: ")? else { continue };
                read_result(console, client.read_from(peer, offset, len))?;
            }
            Action::Navigate => {}
            Action::Invalid => console.say("invalid option\n")?,
        }
    }
    Ok(())
}

/// Drive the server menu until the operator shuts down
///
/// # Errors
///
/// Returns terminal failures.
pub fn run_server<R: BufRead, W: Write>(
    server: &Server,
    console: &mut Console<R, W>,
) -> anyhow::Result<()> {
    console.say(&format!("listening on port {}\n", server.port()))?;
    loop {
        console.say(menu::SERVER_MENU)?;
        let Some(input) = console.line("> ")? else {
            server.shutdown();
            break;
        };
        match menu::server_step(&input) {
            ServerAction::Shutdown => {
                server.shutdown();
                console.say("server stopped\n")?;
                break;
            }
            ServerAction::ViewClients => {
                let records = server.connections();
                if records.is_empty() {
                    console.say("no clients connected\n")?;
                }
                for record in records {
                    let peer = record
                        .peer
                        .map_or_else(|| "unregistered".to_string(), |id| format!("{id:#018x}"));
                    console.say(&format!(
                        "  #{:<4} qpn {:>6}  peer {}  region {}  {}\n",
                        record.id,
                        record.remote_qpn.map_or_else(|| "?".to_string(), |q| q.to_string()),
                        peer,
                        menu::format_bytes(record.region_length as u64),
                        record.status
                    ))?;
                }
            }
            ServerAction::Invalid => console.say("invalid option\n")?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmem_core::{ClientConfig, ServerConfig};
    use rmem_transport::{Fabric, SoftFabric};
    use std::io::Cursor;
    use std::sync::Arc;

    fn scripted(lines: &str) -> Console<Cursor<Vec<u8>>, Vec<u8>> {
        Console::new(Cursor::new(lines.as_bytes().to_vec()), Vec::new())
    }

    #[test]
    fn test_parse_peer_id() {
        assert_eq!(parse_peer_id("42"), Some(42));
        assert_eq!(parse_peer_id(" 0x2a "), Some(42));
        assert_eq!(parse_peer_id("0xZZ"), None);
        assert_eq!(parse_peer_id(""), None);
    }

    #[test]
    fn test_number_reprompts() {
        let mut console = scripted("abc\n17\n");
        assert_eq!(console.number::<u64>("n: ").unwrap(), Some(17));
        let out = String::from_utf8(console.output).unwrap();
        assert!(out.contains("not a number"));
    }

    #[test]
    fn test_line_end_of_input() {
        let mut console = scripted("");
        assert_eq!(console.line("> ").unwrap(), None);
    }

    #[test]
    fn test_client_session_script() {
        let fabric = SoftFabric::in_memory();
        let shared: Arc<dyn Fabric> = Arc::new(fabric.clone());
        let server = Server::bind(shared, ServerConfig::default(), 0).unwrap();
        let addr = format!("127.0.0.1:{}", server.port()).parse().unwrap();
        let client = Client::connect(&fabric, addr, &ClientConfig::default()).unwrap();

        // inline write "hello" at 0, read it back to the console, leave
        let mut console = scripted("2\n0\nhello\n4\n0\n5\nc\n1\n");
        run_client(&client, &mut console).unwrap();

        let out = String::from_utf8(console.output).unwrap();
        assert!(out.contains("written"));
        assert!(out.contains("68 65 6c 6c 6f"));
        assert!(out.contains("disconnected"));
        assert!(client.session().is_torn_down());
        server.shutdown();
    }

    #[test]
    fn test_read_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        let mut console = scripted(&format!("f\n{}\n", path.display()));
        deliver(&mut console, b"hi").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "68 69\n");
    }

    #[test]
    fn test_server_script() {
        let fabric: Arc<dyn Fabric> = Arc::new(SoftFabric::in_memory());
        let server = Server::bind(fabric, ServerConfig::default(), 0).unwrap();

        let mut console = scripted("2\n7\n1\n");
        run_server(&server, &mut console).unwrap();

        let out = String::from_utf8(console.output).unwrap();
        assert!(out.contains("no clients connected"));
        assert!(out.contains("invalid option"));
        assert!(out.contains("server stopped"));
        assert!(server.tasks().is_empty());
    }
}
