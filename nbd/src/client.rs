//! NBD client.
//!
//! Negotiates an export with `NBD_OPT_GO` and issues simple requests. The
//! device bridge only uses the negotiation half; the request half is used to
//! talk to a server directly.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::*;

/// NBD client for connecting to NBD servers.
pub struct NbdClient<S> {
    stream: S,
    next_handle: u64,
    session: Session,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the fixed-newstyle handshake and select `export_name`.
    pub async fn connect(mut stream: S, export_name: &str) -> Result<Self, NbdError> {
        let mut raw = [0u8; 18];
        stream.read_exact(&mut raw).await?;
        let mut hello = &raw[..];

        let magic = hello.get_u64();
        if magic != NBD_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_MAGIC,
                actual: magic,
            });
        }
        if hello.get_u64() != NBD_OPTS_MAGIC {
            return Err(NbdError::NegotiationFailed {
                reason: "server does not speak newstyle negotiation",
            });
        }
        let server_flags = hello.get_u16();
        if (server_flags & NBD_FLAG_FIXED_NEWSTYLE) == 0 {
            return Err(NbdError::NegotiationFailed {
                reason: "server does not support fixed newstyle",
            });
        }
        let mut client_flags = NBD_FLAG_C_FIXED_NEWSTYLE;
        if (server_flags & NBD_FLAG_NO_ZEROES) != 0 {
            client_flags |= NBD_FLAG_C_NO_ZEROES;
        }
        stream.write_u32(client_flags).await?;

        // GO data: name length, name, then a single info request.
        let name = export_name.as_bytes();
        let mut data = BytesMut::with_capacity(4 + name.len() + 4);
        data.put_u32(name.len() as u32);
        data.put_slice(name);
        data.put_u16(1);
        data.put_u16(NBD_INFO_BLOCK_SIZE);
        let header = OptionHeader {
            option: NBD_OPT_GO,
            length: data.len() as u32,
        };
        stream.write_all(&header.encode()).await?;
        stream.write_all(&data).await?;

        let mut session = Session {
            size_bytes: 0,
            transmission_flags: 0,
            block_size: NBD_DEFAULT_BLOCK_SIZE,
        };
        let mut saw_export = false;
        loop {
            let mut raw = [0u8; OptionReplyHeader::SIZE_BYTES];
            stream.read_exact(&mut raw).await?;
            let reply = OptionReplyHeader::decode(&raw)?;

            let mut data = vec![0u8; reply.length as usize];
            stream.read_exact(&mut data).await?;

            if reply.is_error() {
                return Err(NbdError::OptionRejected {
                    option: NBD_OPT_GO,
                    reply: reply.reply,
                });
            }
            match reply.reply {
                NBD_REP_ACK => break,
                NBD_REP_INFO => {
                    let mut info = &data[..];
                    if info.remaining() < 2 {
                        continue;
                    }
                    match info.get_u16() {
                        NBD_INFO_EXPORT if info.remaining() >= 10 => {
                            session.size_bytes = info.get_u64();
                            session.transmission_flags = info.get_u16();
                            saw_export = true;
                        }
                        NBD_INFO_BLOCK_SIZE if info.remaining() >= 12 => {
                            let _minimum = info.get_u32();
                            session.block_size = info.get_u32();
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if !saw_export {
            return Err(NbdError::NegotiationFailed {
                reason: "server acknowledged without export info",
            });
        }

        Ok(Self {
            stream,
            next_handle: 0,
            session,
        })
    }

    /// Negotiated export parameters.
    pub fn session(&self) -> Session {
        self.session
    }

    /// Give back the underlying stream, positioned at transmission phase.
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn send_request(
        &mut self,
        command: NbdCommand,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle;
        self.next_handle += 1;
        let req = NbdRequest {
            flags: 0,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&req.encode()).await?;
        Ok(handle)
    }

    async fn read_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let mut buf = [0u8; NbdReply::SIZE_BYTES];
        self.stream.read_exact(&mut buf).await?;
        let reply = NbdReply::decode(&buf)?;

        if reply.handle != handle {
            return Err(NbdError::HandleMismatch {
                expected: handle,
                actual: reply.handle,
            });
        }
        if reply.error != NBD_OK {
            return Err(NbdError::ServerError { code: reply.error });
        }
        Ok(())
    }

    /// Read `length` bytes at `offset`.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        let handle = self.send_request(NbdCommand::Read, offset, length).await?;
        self.read_reply(handle).await?;

        let mut data = BytesMut::zeroed(length as usize);
        self.stream.read_exact(&mut data).await.map_err(|e| {
            NbdError::Io(io::Error::other(format!(
                "short read of {length} bytes at offset {offset}: {e}"
            )))
        })?;
        Ok(data.freeze())
    }

    /// Write `data` at `offset`.
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), NbdError> {
        let handle = self
            .send_request(NbdCommand::Write, offset, data.len() as u32)
            .await?;
        self.stream.write_all(data).await?;
        self.read_reply(handle).await
    }

    /// Zero a range without sending a payload.
    pub async fn write_zeroes(&mut self, offset: u64, length: u32) -> Result<(), NbdError> {
        let handle = self
            .send_request(NbdCommand::WriteZeroes, offset, length)
            .await?;
        self.read_reply(handle).await
    }

    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.send_request(NbdCommand::Flush, 0, 0).await?;
        self.read_reply(handle).await
    }

    /// Send `NBD_CMD_DISC`; the server closes the connection without a reply.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }
}
