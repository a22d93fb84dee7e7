//! Reader/writer plumbing for one client session.
//!
//! Translates the original client library's reader/writer thread pair
//! (`Npcfsys.readproc`/`writeproc` plus the `Npcreq` pending-request list in
//! `npcimpl.h`) into a tokio reader task and a write-side mutex. A request is a tag
//! allocation, a frame write, and a oneshot receiver awaited by the caller; the reader
//! task is the only thing that ever completes that receiver.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{error, warn};
use nix::errno::Errno;
use tokio::{
    io::{ReadHalf, WriteHalf},
    sync::{Mutex, oneshot},
};
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, FramedWrite, length_delimited::LengthDelimitedCodec};

use rs9p::{error::Error, fcall::*, serialize, transport::Transport, utils::Result};

const DEFAULT_MAX_MSIZE: usize = 1024 * 1024;

type Transports = Box<dyn Transport>;

pub struct ClientConnection {
    tags: crate::tagpool::TagPool,
    pending: Mutex<HashMap<u16, oneshot::Sender<Result<FCall>>>>,
    framedwrite: Mutex<FramedWrite<WriteHalf<Transports>, LengthDelimitedCodec>>,
    msize: AtomicU32,
}

impl ClientConnection {
    /// Connect to `addr` (the same `proto!host!port` grammar the server listens on)
    /// and start the background reader task.
    pub async fn dial(addr: &str) -> Result<Arc<Self>> {
        let transport = rs9p::transport::connect(addr).await?;
        Self::new(transport).await
    }

    /// Build a connection over an already-established transport (a pipe, a
    /// socketpair, anything `AsyncRead + AsyncWrite`), starting the background reader
    /// task the same way [`ClientConnection::dial`] does.
    pub async fn new<T: Transport>(transport: T) -> Result<Arc<Self>> {
        let transport: Transports = Box::new(transport);
        let (readhalf, writehalf) = tokio::io::split(transport);

        let framedread = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .max_frame_length(DEFAULT_MAX_MSIZE)
            .little_endian()
            .new_read(readhalf);
        let framedwrite = LengthDelimitedCodec::builder()
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(-4)
            .max_frame_length(DEFAULT_MAX_MSIZE)
            .little_endian()
            .new_write(writehalf);

        let conn = Arc::new(ClientConnection {
            tags: crate::tagpool::TagPool::new(),
            pending: Mutex::new(HashMap::new()),
            framedwrite: Mutex::new(framedwrite),
            msize: AtomicU32::new(0),
        });

        let reader = conn.clone();
        tokio::spawn(async move {
            reader.read_loop(framedread).await;
        });

        Ok(conn)
    }

    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    async fn read_loop(self: Arc<Self>, mut framedread: FramedRead<ReadHalf<Transports>, LengthDelimitedCodec>) {
        loop {
            let bytes = match framedread.next().await {
                Some(Ok(b)) => b,
                Some(Err(e)) => {
                    error!("connection read error: {:?}", e);
                    break;
                }
                None => break,
            };

            let msg = match serialize::read_msg(&mut bytes.reader()) {
                Ok(m) => m,
                Err(e) => {
                    warn!("dropping undecodable frame: {:?}", e);
                    continue;
                }
            };

            let Some(sender) = self.pending.lock().await.remove(&msg.tag) else {
                warn!("reply for unknown tag {}", msg.tag);
                continue;
            };

            let result = match msg.body {
                FCall::RlError { ecode } => Err(Error::No(Errno::from_raw(ecode as i32))),
                FCall::RError { ename } => {
                    warn!("legacy 9P2000 error reply: {}", ename);
                    Err(Error::No(Errno::EIO))
                }
                body => Ok(body),
            };

            let _ = sender.send(result);
        }

        self.fail_pending("connection closed").await;
    }

    async fn fail_pending(&self, reason: &str) {
        let mut pending = self.pending.lock().await;
        for (_, sender) in pending.drain() {
            let _ = sender.send(Err(Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, reason.to_string()))));
        }
    }

    async fn send(&self, msg: &Msg) -> Result<()> {
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, msg)?;
        let frozen = writer.into_inner().freeze();
        self.framedwrite.lock().await.send(frozen).await?;
        Ok(())
    }

    /// Negotiate `Tversion`, the one RPC that bypasses the tag pool (it always uses
    /// `NOTAG`).
    pub async fn version(&self, msize: u32, version: &str) -> Result<FCall> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(NOTAG, tx);

        let msg = Msg {
            tag: NOTAG,
            body: FCall::TVersion { msize, version: version.to_string() },
        };
        if let Err(e) = self.send(&msg).await {
            self.pending.lock().await.remove(&NOTAG);
            return Err(e);
        }

        let received = rx
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection closed before version reply")))?;

        if let Ok(FCall::RVersion { msize, .. }) = &received {
            self.msize.store(*msize, Ordering::Release);
        }
        received
    }

    /// Issue a request and block until its reply arrives (or the connection dies).
    pub async fn rpc(&self, body: FCall) -> Result<FCall> {
        let tag = self.tags.alloc().await?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(tag, tx);

        let msg = Msg { tag, body };
        if let Err(e) = self.send(&msg).await {
            self.pending.lock().await.remove(&tag);
            self.tags.free(tag).await;
            return Err(e);
        }

        let received = rx
            .await
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::ConnectionReset, "connection closed before reply")));
        self.tags.free(tag).await;
        received?
    }

    /// Non-blocking variant: fires `cb` from a spawned task once the reply (or a
    /// connection failure) arrives, mirroring `npc_rpcnb`'s callback.
    pub fn rpc_nb<F>(self: &Arc<Self>, body: FCall, cb: F)
    where
        F: FnOnce(Result<FCall>) + Send + 'static,
    {
        let conn = self.clone();
        tokio::spawn(async move {
            let result = conn.rpc(body).await;
            cb(result);
        });
    }

    /// Half-close the write side. Outstanding RPCs still in flight fail once the reader
    /// observes EOF.
    pub async fn close(&self) {
        let mut framedwrite = self.framedwrite.lock().await;
        let _ = rs9p::transport::shutdown(framedwrite.get_mut()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Reads one length-delimited request off `sock` (the 9P wire format: a 4-byte LE
    /// size counting itself, then type+tag+body) and returns its decoded `Msg`.
    async fn recv_msg(sock: &mut DuplexStream) -> Msg {
        let mut len_buf = [0u8; 4];
        sock.read_exact(&mut len_buf).await.unwrap();
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len - 4];
        sock.read_exact(&mut payload).await.unwrap();
        serialize::read_msg(&mut payload.as_slice()).unwrap()
    }

    async fn send_msg(sock: &mut DuplexStream, msg: &Msg) {
        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        serialize::write_msg(&mut writer, msg).unwrap();
        let payload = writer.into_inner();
        let total_len = (payload.len() + 4) as u32;
        sock.write_all(&total_len.to_le_bytes()).await.unwrap();
        sock.write_all(&payload).await.unwrap();
    }

    #[tokio::test]
    async fn version_round_trip_sets_msize() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let conn = ClientConnection::new(client_side).await.unwrap();

        let responder = tokio::spawn(async move {
            let req = recv_msg(&mut server_side).await;
            assert_eq!(req.tag, NOTAG);
            assert!(matches!(req.body, FCall::TVersion { .. }));
            send_msg(&mut server_side, &Msg {
                tag: NOTAG,
                body: FCall::RVersion { msize: 8192, version: "9P2000.L".to_string() },
            })
            .await;
            server_side
        });

        let reply = conn.version(65536, "9P2000.L").await.unwrap();
        assert!(matches!(reply, FCall::RVersion { msize: 8192, .. }));
        assert_eq!(conn.msize(), 8192);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn rpc_correlates_reply_by_tag() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let conn = ClientConnection::new(client_side).await.unwrap();

        let responder = tokio::spawn(async move {
            let req = recv_msg(&mut server_side).await;
            let tag = req.tag;
            assert!(matches!(req.body, FCall::TStatFs { fid: 0 }));
            send_msg(&mut server_side, &Msg {
                tag,
                body: FCall::RStatFs {
                    statfs: StatFs {
                        typ: 0,
                        bsize: 0,
                        blocks: 0,
                        bfree: 0,
                        bavail: 0,
                        files: 0,
                        ffree: 0,
                        fsid: 0,
                        namelen: 0,
                    },
                },
            })
            .await;
            server_side
        });

        let reply = conn.rpc(FCall::TStatFs { fid: 0 }).await.unwrap();
        assert!(matches!(reply, FCall::RStatFs { .. }));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn rlerror_reply_becomes_errno_error() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let conn = ClientConnection::new(client_side).await.unwrap();

        let responder = tokio::spawn(async move {
            let req = recv_msg(&mut server_side).await;
            send_msg(&mut server_side, &Msg {
                tag: req.tag,
                body: FCall::RlError { ecode: Errno::ENOENT as u32 },
            })
            .await;
            server_side
        });

        let err = conn.rpc(FCall::TClunk { fid: 0 }).await.unwrap_err();
        assert!(matches!(err, Error::No(Errno::ENOENT)));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn reply_for_unknown_tag_is_dropped_not_fatal() {
        let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
        let conn = ClientConnection::new(client_side).await.unwrap();

        let responder = tokio::spawn(async move {
            // Reply with a tag nobody is waiting on, then answer the real request.
            send_msg(&mut server_side, &Msg { tag: 999, body: FCall::RClunk }).await;
            let req = recv_msg(&mut server_side).await;
            send_msg(&mut server_side, &Msg { tag: req.tag, body: FCall::RClunk }).await;
            server_side
        });

        let reply = conn.rpc(FCall::TClunk { fid: 1 }).await.unwrap();
        assert!(matches!(reply, FCall::RClunk));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_fails_pending_rpcs() {
        let (client_side, server_side) = tokio::io::duplex(64 * 1024);
        let conn = ClientConnection::new(client_side).await.unwrap();
        drop(server_side);

        let err = conn.rpc(FCall::TClunk { fid: 0 }).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
