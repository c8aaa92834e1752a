//! Wire protocol between a pool and its isolated runtime processes
//!
//! Messages are MessagePack (named fields) inside frames carrying a 4-byte
//! big-endian length prefix.

use crate::error::RemoteFailure;
use crate::policy::PolicyHandle;
use crate::pool::SandboxTask;
use crate::result::SandboxedCallResult;
use crate::unit::Argument;
use crate::{PalisadeError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Largest frame either side accepts
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Request types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe
    Ping,
    /// Bind the session to a policy
    Init { policy: PolicyHandle },
    /// Clear the session binding
    Reset,
    /// Ad hoc task execution
    Execute { task: SandboxTask },
    RunInContext { unit: String, args: Vec<Argument> },
    RunSandboxed { unit: String, args: Vec<Argument> },
    /// Seed the process's policy registry
    RegisterContext { name: String, policy: PolicyHandle },
    /// Stop the process
    Shutdown,
}

impl Request {
    /// Short label for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Init { .. } => "init",
            Self::Reset => "reset",
            Self::Execute { .. } => "execute",
            Self::RunInContext { .. } => "run_in_context",
            Self::RunSandboxed { .. } => "run_sandboxed",
            Self::RegisterContext { .. } => "register_context",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Response types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Liveness answer carrying the process name
    Pong { name: String },
    Done,
    Result { result: SandboxedCallResult },
    Failure { failure: RemoteFailure },
}

impl Response {
    pub fn failure(error: &PalisadeError) -> Self {
        Self::Failure {
            failure: RemoteFailure::from(error),
        }
    }

    /// Expect a call result; a remote failure becomes the matching local error.
    pub fn into_result(self) -> Result<SandboxedCallResult> {
        match self {
            Self::Result { result } => Ok(result),
            Self::Failure { failure } => Err(failure.into_error()),
            other => Err(unexpected(&other)),
        }
    }

    /// Expect an acknowledgement.
    pub fn into_done(self) -> Result<()> {
        match self {
            Self::Done => Ok(()),
            Self::Failure { failure } => Err(failure.into_error()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> PalisadeError {
    PalisadeError::Codec(format!("unexpected response: {response:?}"))
}

/// Encode a message to msgpack
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(msg)?)
}

/// Decode a message from msgpack
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(data)?)
}

/// Length prefix for a payload, rejecting oversized frames
pub fn frame_header(len: usize) -> Result<[u8; 4]> {
    check_len(len)?;
    let len = u32::try_from(len).map_err(|_| PalisadeError::Codec(format!("frame too large: {len} bytes")))?;
    Ok(len.to_be_bytes())
}

/// Payload length announced by a header
pub fn frame_len(header: [u8; 4]) -> Result<usize> {
    let len = u32::from_be_bytes(header) as usize;
    check_len(len)?;
    Ok(len)
}

fn check_len(len: usize) -> Result<()> {
    if len > MAX_FRAME_LEN {
        return Err(PalisadeError::Codec(format!("frame too large: {len} bytes")));
    }
    Ok(())
}

/// Write one message as a frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let payload = encode(msg)?;
    writer.write_all(&frame_header(payload.len())?)?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame and decode it.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; 4];
    reader.read_exact(&mut header)?;
    let mut payload = vec![0u8; frame_len(header)?];
    reader.read_exact(&mut payload)?;
    decode(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::policy::PermissionPolicy;
    use crate::result::DomainId;
    use serde_json::json;
    use std::io::Cursor;

    #[test]
    fn frames_carry_requests_with_policies() {
        let mut policy = PermissionPolicy::new("remote");
        policy.allow_class_prefix("app.");
        let mut buf = Vec::new();
        write_frame(&mut buf, &Request::Init { policy: policy.freeze() }).expect("write");
        assert_eq!(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize, buf.len() - 4);

        let decoded: Request = read_frame(&mut Cursor::new(buf)).expect("read");
        match decoded {
            Request::Init { policy } => {
                assert_eq!(policy.name(), "remote");
                assert!(policy.check_class_access("app.Main", &crate::AccessStack::default()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn remote_failures_map_back_to_local_errors() {
        let response = Response::failure(&PalisadeError::AccessDenied {
            request: "class app.Danger".into(),
        });
        let mut buf = Vec::new();
        write_frame(&mut buf, &response).expect("write");
        let decoded: Response = read_frame(&mut Cursor::new(buf)).expect("read");
        assert!(matches!(
            decoded.clone(),
            Response::Failure { failure } if failure.kind == FailureKind::AccessDenied
        ));
        assert!(matches!(decoded.into_result(), Err(PalisadeError::AccessDenied { .. })));
    }

    #[test]
    fn results_survive_the_wire() {
        let result = SandboxedCallResult::new(json!({"sum": 3}), DomainId::new("remote@1.0"));
        let decoded: Response = decode(&encode(&Response::Result { result }).expect("encode")).expect("decode");
        let result = decoded.into_result().expect("result");
        assert_eq!(result.raw(), &json!({"sum": 3}));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let header = u32::try_from(MAX_FRAME_LEN + 1).expect("fits").to_be_bytes();
        assert!(matches!(frame_len(header), Err(PalisadeError::Codec(_))));
    }

    #[test]
    fn unexpected_responses_are_codec_errors() {
        assert!(matches!(Response::Done.into_result(), Err(PalisadeError::Codec(_))));
        assert!(Response::Done.into_done().is_ok());
    }
}
