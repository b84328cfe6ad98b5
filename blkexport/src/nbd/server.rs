//! NBD protocol engine for a single connection.
//!
//! [`NbdServer::serve`] runs the fixed-newstyle handshake, option haggling
//! and the transmission phase over any async stream. Accepting connections
//! and deciding how many to serve belongs to the daemon.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use nbd::*;

use super::handler::{HandlerResult, TransmissionHandler};
use crate::error::VolumeError;
use crate::types::PREFERRED_BLOCK_SIZE;

/// What clients negotiate against.
#[derive(Debug, Clone)]
pub struct NbdExport {
    pub name: String,
    pub size_bytes: u64,
    pub read_only: bool,
}

impl NbdExport {
    pub fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS
            | NBD_FLAG_SEND_FLUSH
            | NBD_FLAG_SEND_FUA
            | NBD_FLAG_SEND_WRITE_ZEROES;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }

    /// An empty name selects the default export, which is this one.
    fn matches(&self, requested: &[u8]) -> bool {
        requested.is_empty() || requested == self.name.as_bytes()
    }
}

/// Serves one connection at a time through a shared handler.
#[derive(Clone)]
pub struct NbdServer {
    handler: Arc<dyn TransmissionHandler>,
}

impl NbdServer {
    pub fn new(handler: Arc<dyn TransmissionHandler>) -> Self {
        Self { handler }
    }

    /// Serve a connection until the client disconnects or errors.
    pub async fn serve<S>(&self, mut stream: S, export: &NbdExport) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let no_zeroes = handshake(&mut stream).await?;
        if !negotiate_options(&mut stream, export, no_zeroes).await? {
            return Ok(());
        }
        transmission(&mut stream, self.handler.as_ref(), export).await
    }
}

async fn handshake<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = BytesMut::with_capacity(18);
    hello.put_u64(NBD_MAGIC);
    hello.put_u64(NBD_OPTS_MAGIC);
    hello.put_u16(NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES);
    stream.write_all(&hello).await?;

    let client_flags = stream.read_u32().await?;
    if (client_flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
        return Err(NbdError::NegotiationFailed {
            reason: "client must use fixed newstyle",
        });
    }
    Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
}

/// Returns `false` when the client gave up before transmission.
async fn negotiate_options<S>(
    stream: &mut S,
    export: &NbdExport,
    no_zeroes: bool,
) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut raw = [0u8; OptionHeader::SIZE_BYTES];
        stream.read_exact(&mut raw).await?;
        let OptionHeader { option, length } = OptionHeader::decode(&raw)?;

        let mut data = vec![0u8; length as usize];
        stream.read_exact(&mut data).await?;
        debug!(option, length, "NBD option");

        match option {
            NBD_OPT_EXPORT_NAME => {
                // No error reply exists for this option; hang up instead.
                if !export.matches(&data) {
                    return Ok(false);
                }
                let mut reply = BytesMut::with_capacity(10 + 124);
                reply.put_u64(export.size_bytes);
                reply.put_u16(export.transmission_flags());
                if !no_zeroes {
                    reply.put_bytes(0, 124);
                }
                stream.write_all(&reply).await?;
                return Ok(true);
            }
            NBD_OPT_GO | NBD_OPT_INFO => {
                let Some(name) = parse_info_request(&data) else {
                    send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    continue;
                };
                if !export.matches(name) {
                    send_reply(stream, option, NBD_REP_ERR_UNKNOWN, &[]).await?;
                    continue;
                }

                // Export info and block sizes are sent whether asked for or not.
                let mut info = BytesMut::with_capacity(12);
                info.put_u16(NBD_INFO_EXPORT);
                info.put_u64(export.size_bytes);
                info.put_u16(export.transmission_flags());
                send_reply(stream, option, NBD_REP_INFO, &info).await?;

                let mut sizes = BytesMut::with_capacity(14);
                sizes.put_u16(NBD_INFO_BLOCK_SIZE);
                sizes.put_u32(NBD_MIN_BLOCK_SIZE);
                sizes.put_u32(PREFERRED_BLOCK_SIZE);
                sizes.put_u32(NBD_MAX_PAYLOAD_SIZE);
                send_reply(stream, option, NBD_REP_INFO, &sizes).await?;

                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                if option == NBD_OPT_GO {
                    return Ok(true);
                }
            }
            NBD_OPT_LIST => {
                let name = export.name.as_bytes();
                let mut entry = BytesMut::with_capacity(4 + name.len());
                entry.put_u32(name.len() as u32);
                entry.put_slice(name);
                send_reply(stream, option, NBD_REP_SERVER, &entry).await?;
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
            }
            NBD_OPT_ABORT => {
                send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                return Ok(false);
            }
            _ => send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?,
        }
    }
}

/// Pull the export name out of `NBD_OPT_GO`/`NBD_OPT_INFO` data.
///
/// Layout: name length (u32), name, info request count (u16), requests.
fn parse_info_request(data: &[u8]) -> Option<&[u8]> {
    let mut header = data.get(..4)?;
    let name_len = header.get_u32() as usize;
    let name = data.get(4..4 + name_len)?;

    let mut rest = data.get(4 + name_len..)?;
    if rest.remaining() < 2 {
        return None;
    }
    let requests = rest.get_u16() as usize;
    (rest.remaining() == 2 * requests).then_some(name)
}

async fn send_reply<S>(
    stream: &mut S,
    option: u32,
    reply: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = OptionReplyHeader {
        option,
        reply,
        length: data.len() as u32,
    };
    stream.write_all(&header.encode()).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

/// What the transmission loop sends back for one request.
enum Outcome {
    Done(u32),
    Data(Bytes),
    Disconnect,
}

/// Map a handler result to the NBD error code carried in the reply.
fn reply_code(op: &'static str, result: HandlerResult<()>) -> u32 {
    match result {
        Ok(()) => NBD_OK,
        Err(e) => error_code(op, e),
    }
}

fn error_code(op: &'static str, error: VolumeError) -> u32 {
    match error {
        VolumeError::OutOfBounds { .. } => NBD_EINVAL,
        VolumeError::ReadOnly => NBD_EPERM,
        e => {
            warn!(op, error = %e, "request failed");
            NBD_EIO
        }
    }
}

async fn transmission<S>(
    stream: &mut S,
    handler: &dyn TransmissionHandler,
    export: &NbdExport,
) -> Result<(), NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut raw = [0u8; NbdRequest::SIZE_BYTES];

    loop {
        if let Err(e) = stream.read_exact(&mut raw).await {
            return match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Ok(()),
                _ => Err(e.into()),
            };
        }

        let req = match NbdRequest::decode(&raw, export.size_bytes) {
            Ok(req) => req,
            Err(e @ NbdError::RequestTooLarge { .. }) => {
                // Any payload that follows cannot be skipped safely, so
                // report the overflow and drop the connection.
                let reply = NbdReply::error(NbdRequest::peek_handle(&raw), NBD_EOVERFLOW);
                stream.write_all(&reply.encode()).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let payload = if req.command == NbdCommand::Write {
            let mut data = BytesMut::zeroed(req.length as usize);
            stream.read_exact(&mut data).await?;
            Some(data.freeze())
        } else {
            None
        };

        match dispatch(handler, export, &req, payload).await {
            Outcome::Disconnect => return Ok(()),
            Outcome::Data(data) => {
                stream.write_all(&NbdReply::ok(req.handle).encode()).await?;
                stream.write_all(&data).await?;
            }
            Outcome::Done(code) => {
                stream
                    .write_all(&NbdReply::error(req.handle, code).encode())
                    .await?;
            }
        }
    }
}

async fn dispatch(
    handler: &dyn TransmissionHandler,
    export: &NbdExport,
    req: &NbdRequest,
    payload: Option<Bytes>,
) -> Outcome {
    let modifies = matches!(
        req.command,
        NbdCommand::Write | NbdCommand::WriteZeroes | NbdCommand::Trim
    );
    if modifies && export.read_only {
        return Outcome::Done(NBD_EPERM);
    }

    let (offset, length) = (req.offset, req.length);
    match req.command {
        NbdCommand::Read => match handler.read(offset, length as usize).await {
            Ok(data) => Outcome::Data(data),
            Err(e) => Outcome::Done(error_code("read", e)),
        },
        NbdCommand::Write => {
            let data = payload.unwrap_or_default();
            let mut result = handler.write(offset, data).await;
            if result.is_ok() && (req.flags & NBD_CMD_FLAG_FUA) != 0 {
                result = handler.flush().await;
            }
            Outcome::Done(reply_code("write", result))
        }
        NbdCommand::WriteZeroes => Outcome::Done(reply_code(
            "write_zeroes",
            handler.write_zeroes(offset, length as u64).await,
        )),
        NbdCommand::Trim => Outcome::Done(reply_code(
            "trim",
            handler.trim(offset, length as u64).await,
        )),
        NbdCommand::Flush => Outcome::Done(reply_code("flush", handler.flush().await)),
        NbdCommand::Disconnect => Outcome::Disconnect,
    }
}
