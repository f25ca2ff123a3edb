//! UDP control server
//!
//! Single-threaded: the loop alternates between receiving one datagram (with
//! a short read timeout) and polling the session, so loader results and
//! engine events are handled even when no client is talking.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rosc::{OscMessage, OscPacket};

use super::dispatch::{dispatch, Reply};
use super::message::{ControlMessage, ProtocolError};
use crate::session::Session;

/// Default read timeout, also the session poll interval when idle
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Largest datagram accepted
const MAX_PACKET: usize = 8192;

/// Why [`ControlServer::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerExit {
    /// The stop flag was raised
    Stopped,
    /// The audio device went away
    DeviceLost,
}

pub struct ControlServer {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl ControlServer {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        Self::bind_with_interval(addr, DEFAULT_POLL_INTERVAL)
    }

    pub fn bind_with_interval(addr: impl ToSocketAddrs, interval: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_read_timeout(Some(interval))?;
        log::info!("Control server listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            buf: vec![0; MAX_PACKET],
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Serve until `stop` is raised or the audio device is lost
    pub fn run(&mut self, session: &mut Session, stop: &AtomicBool) -> io::Result<ServerExit> {
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(ServerExit::Stopped);
            }
            if session.is_device_lost() {
                log::error!("Audio device lost, stopping control server");
                return Ok(ServerExit::DeviceLost);
            }
            self.serve_once(session)?;
            session.poll();
        }
    }

    /// Wait up to the read timeout for one datagram and handle it
    ///
    /// Returns the number of control messages handled.
    pub fn serve_once(&mut self, session: &mut Session) -> io::Result<usize> {
        let (len, peer) = match self.socket.recv_from(&mut self.buf) {
            Ok(received) => received,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => return Ok(0),
            Err(e) => return Err(e),
        };

        let packet = match rosc::decoder::decode_udp(&self.buf[..len]) {
            Ok((_, packet)) => packet,
            Err(e) => {
                let error = ProtocolError::Malformed(format!("{:?}", e));
                log::warn!("From {}: {}", peer, error);
                self.send(&Reply::error("", error.to_string()).to_osc(), peer);
                return Ok(0);
            }
        };

        let mut messages = Vec::new();
        flatten(packet, &mut messages);
        let handled = messages.len();
        for msg in messages {
            for response in handle(session, &msg) {
                self.send(&response, peer);
            }
        }
        Ok(handled)
    }

    fn send(&self, message: &OscMessage, peer: SocketAddr) {
        match rosc::encoder::encode(&OscPacket::Message(message.clone())) {
            Ok(bytes) => {
                if let Err(e) = self.socket.send_to(&bytes, peer) {
                    log::warn!("Failed to reply to {}: {}", peer, e);
                }
            }
            Err(e) => log::warn!("Failed to encode {}: {:?}", message.addr, e),
        }
    }
}

/// Parse and dispatch one message
pub fn handle(session: &mut Session, msg: &OscMessage) -> Vec<OscMessage> {
    match ControlMessage::parse(msg) {
        Ok(message) => {
            log::debug!("{:?}", message);
            dispatch(session, message)
        }
        Err(e) => {
            log::warn!("Rejected {}: {}", msg.addr, e);
            vec![Reply::error(&msg.addr, e.to_string()).to_osc()]
        }
    }
}

fn flatten(packet: OscPacket, out: &mut Vec<OscMessage>) {
    match packet {
        OscPacket::Message(msg) => out.push(msg),
        OscPacket::Bundle(bundle) => {
            for inner in bundle.content {
                flatten(inner, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::SongCatalog;
    use crate::engine::{EngineAtomics, EngineConfig, RenderEngine};
    use crate::session::SessionConfig;
    use rosc::{OscBundle, OscTime, OscType};
    use std::sync::Arc;

    fn session() -> (Session, RenderEngine) {
        let atomics = Arc::new(EngineAtomics::new());
        let (engine, tx, events) = RenderEngine::with_channels(EngineConfig::default(), atomics.clone());
        let session = Session::new(SongCatalog::new(), tx, events, atomics, SessionConfig::default());
        (session, engine)
    }

    fn client() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        socket
    }

    fn send(socket: &UdpSocket, to: SocketAddr, packet: OscPacket) {
        let bytes = rosc::encoder::encode(&packet).unwrap();
        socket.send_to(&bytes, to).unwrap();
    }

    fn receive(socket: &UdpSocket) -> OscMessage {
        let mut buf = vec![0; MAX_PACKET];
        let (len, _) = socket.recv_from(&mut buf).unwrap();
        match rosc::decoder::decode_udp(&buf[..len]).unwrap().1 {
            OscPacket::Message(msg) => msg,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn text(msg: &OscMessage, index: usize) -> &str {
        match &msg.args[index] {
            OscType::String(s) => s,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_round_trip_over_udp() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = client();

        send(
            &client,
            addr,
            OscPacket::Message(ControlMessage::Bpm { bpm: 130.0 }.to_osc()),
        );
        assert_eq!(server.serve_once(&mut session).unwrap(), 1);

        let reply = receive(&client);
        assert_eq!(reply.addr, "/reply");
        assert_eq!(text(&reply, 0), "/bpm");
        assert_eq!(text(&reply, 1), "ok");
        assert_eq!(session.global_bpm(), 130.0);
    }

    #[test]
    fn test_malformed_message_gets_error_reply() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = client();

        send(
            &client,
            addr,
            OscPacket::Message(OscMessage {
                addr: "/bpm".into(),
                args: vec![OscType::String("fast".into())],
            }),
        );
        server.serve_once(&mut session).unwrap();

        let reply = receive(&client);
        assert_eq!(text(&reply, 0), "/bpm");
        assert_eq!(text(&reply, 1), "error");
        assert_eq!(session.global_bpm(), SessionConfig::default().global_bpm);

        client.send_to(b"not osc", addr).unwrap();
        assert_eq!(server.serve_once(&mut session).unwrap(), 0);
        assert_eq!(text(&receive(&client), 1), "error");
    }

    #[test]
    fn test_bundles_are_unpacked() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap();
        let client = client();

        let bundle = OscBundle {
            timetag: OscTime {
                seconds: 0,
                fractional: 1,
            },
            content: vec![
                OscPacket::Message(ControlMessage::Volume { level: 0.5 }.to_osc()),
                OscPacket::Message(ControlMessage::SetKey { key: "Am".into() }.to_osc()),
            ],
        };
        send(&client, addr, OscPacket::Bundle(bundle));
        assert_eq!(server.serve_once(&mut session).unwrap(), 2);

        assert_eq!(text(&receive(&client), 0), "/volume");
        let key_reply = receive(&client);
        assert_eq!(text(&key_reply, 0), "/set_key");
        assert_eq!(text(&key_reply, 2), "8A");
    }

    #[test]
    fn test_idle_serve_times_out() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind_with_interval("127.0.0.1:0", Duration::from_millis(5)).unwrap();
        assert_eq!(server.serve_once(&mut session).unwrap(), 0);
    }

    #[test]
    fn test_run_stops_on_flag() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind("127.0.0.1:0").unwrap();
        let stop = AtomicBool::new(true);
        assert_eq!(server.run(&mut session, &stop).unwrap(), ServerExit::Stopped);
    }

    #[test]
    fn test_run_stops_when_flag_raised_later() {
        let (mut session, _engine) = session();
        let mut server = ControlServer::bind_with_interval("127.0.0.1:0", Duration::from_millis(5)).unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        // Same as an interrupt handler firing while the loop is idle
        let raiser = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                stop.store(true, Ordering::Release);
            })
        };
        assert_eq!(server.run(&mut session, &stop).unwrap(), ServerExit::Stopped);
        raiser.join().unwrap();
    }

    #[test]
    fn test_run_stops_on_device_loss() {
        let (mut session, _engine) = session();
        session.atomics().mark_device_lost();
        let mut server = ControlServer::bind("127.0.0.1:0").unwrap();
        let stop = AtomicBool::new(false);
        assert_eq!(server.run(&mut session, &stop).unwrap(), ServerExit::DeviceLost);
    }
}
