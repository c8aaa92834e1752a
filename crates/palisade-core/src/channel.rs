//! Blocking RPC channel to an isolated runtime process

use crate::protocol::{self, Request, Response};
use crate::{PalisadeError, Result};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

/// One connection to a runtime process. Calls are strictly request/response.
#[derive(Debug)]
pub struct RpcChannel {
    stream: TcpStream,
    port: u16,
}

impl RpcChannel {
    /// Connect to a process listening on localhost.
    pub fn connect(port: u16, timeout: Duration) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| PalisadeError::ProcessUnreachable(format!("connect to port {port}: {e}")))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, port })
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Bound how long a single read may block; `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn send(&mut self, request: &Request) -> Result<()> {
        protocol::write_frame(&mut self.stream, request).map_err(|e| self.unreachable(&e))
    }

    pub fn recv(&mut self) -> Result<Response> {
        protocol::read_frame(&mut self.stream).map_err(|e| self.unreachable(&e))
    }

    /// Send a request and wait for its response. Transport failures are
    /// reported as `ProcessUnreachable`.
    pub fn call(&mut self, request: &Request) -> Result<Response> {
        tracing::trace!(port = self.port, request = request.kind(), "rpc call");
        self.send(request)?;
        self.recv()
    }

    fn unreachable(&self, error: &PalisadeError) -> PalisadeError {
        match error {
            PalisadeError::Io(e) => PalisadeError::ProcessUnreachable(format!("port {}: {e}", self.port)),
            PalisadeError::Codec(msg) => PalisadeError::Codec(msg.clone()),
            other => PalisadeError::ProcessUnreachable(format!("port {}: {other}", self.port)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn call_round_trips_through_a_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request: Request = protocol::read_frame(&mut stream).expect("request");
            assert!(matches!(request, Request::Ping));
            protocol::write_frame(&mut stream, &Response::Pong { name: "Nr1".into() }).expect("response");
        });

        let mut channel = RpcChannel::connect(port, Duration::from_secs(1)).expect("connect");
        let response = channel.call(&Request::Ping).expect("call");
        assert!(matches!(response, Response::Pong { name } if name == "Nr1"));
        server.join().expect("server");
    }

    #[test]
    fn closed_peer_is_unreachable() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            drop(stream);
        });

        let mut channel = RpcChannel::connect(port, Duration::from_secs(1)).expect("connect");
        server.join().expect("server");
        assert!(matches!(channel.call(&Request::Ping), Err(PalisadeError::ProcessUnreachable(_))));
    }
}
