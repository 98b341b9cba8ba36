//! Line echo server run by the `handoff worker` subcommand.
//!
//! Every session starts with a banner naming the slot and worker that
//! serves it, then echoes each line back.

use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;

use crate::worker::{LocalServer, SlotIndex, WorkerId};

/// Echo server for one worker.
#[derive(Debug, Clone)]
pub struct EchoServer {
    banner: Arc<str>,
}

impl EchoServer {
    pub fn new(slot: Option<SlotIndex>, worker: WorkerId) -> Self {
        let slot = slot.map_or_else(|| "-".to_string(), |s| s.to_string());
        Self {
            banner: format!("handoff slot={} worker={}\n", slot, worker).into(),
        }
    }

    pub fn banner(&self) -> &str {
        &self.banner
    }
}

impl LocalServer for EchoServer {
    fn listen(&mut self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let listener = TcpListener::bind((host, port))?;
        let addr = listener.local_addr()?;
        let banner = self.banner.clone();

        std::thread::Builder::new()
            .name("echo-accept".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => spawn_session(banner.clone(), stream),
                        Err(e) => tracing::debug!(error = %e, "Local accept failed"),
                    }
                }
            })?;
        Ok(addr)
    }

    fn connection(&mut self, stream: TcpStream) {
        spawn_session(self.banner.clone(), stream);
    }
}

fn spawn_session(banner: Arc<str>, stream: TcpStream) {
    let spawned = std::thread::Builder::new()
        .name("echo-session".to_string())
        .spawn(move || {
            if let Err(e) = session(&banner, stream) {
                tracing::debug!(error = %e, "Echo session ended with error");
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start echo session");
    }
}

fn session(banner: &str, stream: TcpStream) -> io::Result<()> {
    let mut writer = stream.try_clone()?;
    writer.write_all(banner.as_bytes())?;
    for line in BufReader::new(stream).lines() {
        writeln!(writer, "{}", line?)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(stream: TcpStream, line: &str) -> (String, String) {
        let mut writer = stream.try_clone().unwrap();
        let mut reader = BufReader::new(stream);
        let mut banner = String::new();
        reader.read_line(&mut banner).unwrap();
        writeln!(writer, "{}", line).unwrap();
        let mut echoed = String::new();
        reader.read_line(&mut echoed).unwrap();
        (banner, echoed)
    }

    #[test]
    fn test_banner() {
        let server = EchoServer::new(Some(2), WorkerId::new(9));
        assert_eq!(server.banner(), "handoff slot=2 worker=#9\n");
        let server = EchoServer::new(None, WorkerId::new(1));
        assert_eq!(server.banner(), "handoff slot=- worker=#1\n");
    }

    #[test]
    fn test_listen_serves_local_clients() {
        let mut server = EchoServer::new(Some(0), WorkerId::new(1));
        let addr = server.listen("127.0.0.1", 0).unwrap();
        assert_ne!(addr.port(), 0);

        let (banner, echoed) = exchange(TcpStream::connect(addr).unwrap(), "ping");
        assert_eq!(banner, "handoff slot=0 worker=#1\n");
        assert_eq!(echoed, "ping\n");
    }

    #[test]
    fn test_injected_connection_is_served() {
        let mut server = EchoServer::new(Some(1), WorkerId::new(4));
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();

        server.connection(accepted);
        let (banner, echoed) = exchange(client, "hello there");
        assert_eq!(banner, "handoff slot=1 worker=#4\n");
        assert_eq!(echoed, "hello there\n");
    }
}
