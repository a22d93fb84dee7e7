//! Per-connection request dispatch.
//!
//! One [`Connection`] is created per accepted socket. It owns the fid table for that
//! socket and the bookkeeping needed to answer `Tflush`: a map from in-flight tag to a
//! cancellation signal. The reference server never implemented `Tflush` at all (`rflush`
//! was called with no way to actually find, let alone cancel, the original request) —
//! this is the piece that makes it real.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};

use bytes::buf::{Buf, BufMut};
use futures::sink::SinkExt;
use log::{error, info};
use tokio::sync::{Mutex, oneshot};
use tokio_stream::StreamExt;
use tokio_util::codec::length_delimited::LengthDelimitedCodec;

use crate::{
    error::{self, errno::*},
    fcall::*,
    fidpool::FidPool,
    serialize,
    srv::Filesystem,
    transport::Transport,
    utils::Result,
    workerpool::WorkerPool,
};

/// A message is rejected outright above this size until `Tversion` negotiates something
/// smaller or larger; matches the `msize` ceiling the codec enforces before a version
/// handshake has happened.
const DEFAULT_MAX_MSIZE: usize = 1024 * 1024;

pub struct Connection<Fs: Filesystem> {
    fs: Arc<Fs>,
    fids: FidPool<Fs::FId>,
    pending: Mutex<HashMap<u16, oneshot::Sender<()>>>,
    msize: AtomicU32,
}

impl<Fs: Filesystem + Send + Sync + 'static> Connection<Fs> {
    pub fn new(fs: Arc<Fs>) -> Arc<Self> {
        Arc::new(Connection {
            fs,
            fids: FidPool::new(),
            pending: Mutex::new(HashMap::new()),
            msize: AtomicU32::new(0),
        })
    }

    /// Current negotiated `msize`, or 0 before `Tversion` has completed.
    pub fn msize(&self) -> u32 {
        self.msize.load(Ordering::Acquire)
    }

    /// Number of fids still bound on this connection. Exposed for diagnosing fid leaks
    /// on connection teardown.
    pub async fn fid_count(&self) -> usize {
        self.fids.count().await
    }

    /// Run the accept-to-eof loop for one transport, spawning each request onto `pool`.
    pub async fn serve<T: Transport>(self: Arc<Self>, transport: T, pool: Arc<WorkerPool>) -> Result<()> {
        let (readhalf, writehalf) = tokio::io::split(transport);

        let mut framedread = LengthDelimitedCodec::builder()
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
        let framedwrite = Arc::new(Mutex::new(framedwrite));

        while let Some(bytes) = framedread.next().await {
            let bytes = bytes?;
            let msg = serialize::read_msg(&mut bytes.reader())?;
            info!("\t← {:?}", msg);

            // Register this request's cancel channel synchronously, in frame order,
            // before spawning its task. A Tflush for this tag can arrive on the very
            // next frame and be dispatched on its own concurrently scheduled task; if
            // registration instead happened inside that spawned task, the flush could
            // run first and find nothing to cancel.
            let cancel_rx = if matches!(msg.body, FCall::TFlush { .. }) {
                None
            } else {
                let (cancel_tx, cancel_rx) = oneshot::channel();
                self.pending.lock().await.insert(msg.tag, cancel_tx);
                Some(cancel_rx)
            };

            let conn = self.clone();
            let framedwrite = framedwrite.clone();

            pool.spawn(async move {
                conn.handle(msg, framedwrite, cancel_rx).await;
            });
        }

        Ok(())
    }

    async fn handle(
        self: Arc<Self>,
        msg: Msg,
        framedwrite: Arc<Mutex<tokio_util::codec::FramedWrite<impl tokio::io::AsyncWrite + Unpin, LengthDelimitedCodec>>>,
        cancel_rx: Option<oneshot::Receiver<()>>,
    ) {
        let tag = msg.tag;

        let reply = match self.dispatch(msg, cancel_rx).await {
            DispatchOutcome::Reply(response) => Some(response),
            DispatchOutcome::Flushed => None,
        };

        let Some(response) = reply else {
            return;
        };

        if !MsgType::from(&response.body).is_r() {
            return;
        }

        let mut writer = bytes::BytesMut::with_capacity(4096).writer();
        if let Err(e) = serialize::write_msg(&mut writer, &response) {
            error!("Failed to serialize response for tag {}: {:?}", tag, e);
            return;
        }

        let frozen = writer.into_inner().freeze();
        let mut framedwrite = framedwrite.lock().await;
        if let Err(e) = framedwrite.send(frozen).await {
            error!("Failed to send response for tag {}: {:?}", tag, e);
            return;
        }
        info!("\t→ {:?}", response);
    }

    async fn dispatch(self: &Arc<Self>, msg: Msg, cancel_rx: Option<oneshot::Receiver<()>>) -> DispatchOutcome {
        if let FCall::TFlush { oldtag } = &msg.body {
            self.flush(*oldtag).await;
            return DispatchOutcome::Reply(Msg {
                tag: msg.tag,
                body: FCall::RFlush,
            });
        }

        let mut cancel_rx = cancel_rx.expect("non-flush requests always carry a cancel channel registered in serve()");

        let negotiated = self.msize();
        if negotiated != 0 {
            // `Tread`'s `count` is the one field a peer can inflate to request more
            // than the negotiated `msize` allows without sending an oversized frame;
            // everything else is already bounded by the codec's frame-length limit.
            if let FCall::TRead { count, .. } = &msg.body {
                if *count > negotiated {
                    self.pending.lock().await.remove(&msg.tag);
                    return self.error_reply(msg.tag, error::Error::TooBig {
                        msize: negotiated,
                        len: *count as usize,
                    });
                }
            }
        }

        let is_version = matches!(&msg.body, FCall::TVersion { .. });
        let tag = msg.tag;

        let result = tokio::select! {
            biased;
            _ = &mut cancel_rx => {
                self.pending.lock().await.remove(&tag);
                return DispatchOutcome::Flushed;
            }
            result = dispatch_once(&msg, self.fs.clone(), &self.fids) => result,
        };

        self.pending.lock().await.remove(&tag);

        if is_version {
            // A fresh Tversion resets the session: every fid from the previous
            // negotiation is gone, and nothing still pending can be answered against
            // the old message size.
            self.fids.destroy().await;
            if let Ok(FCall::RVersion { msize, .. }) = &result {
                self.msize.store(*msize, Ordering::Release);
            }
            let mut pending = self.pending.lock().await;
            for (_, cancel) in pending.drain() {
                let _ = cancel.send(());
            }
        }

        match result {
            Ok(body) => DispatchOutcome::Reply(Msg { tag, body }),
            Err(e) => {
                error!("{:?}: Error: \"{}\": {:?}", MsgType::from(&msg.body), e, e);
                DispatchOutcome::Reply(Msg {
                    tag,
                    body: FCall::RlError { ecode: e.errno() as u32 },
                })
            }
        }
    }

    async fn flush(&self, oldtag: u16) {
        if let Some(cancel) = self.pending.lock().await.remove(&oldtag) {
            let _ = cancel.send(());
        }
    }

    fn error_reply(&self, tag: u16, e: error::Error) -> DispatchOutcome {
        DispatchOutcome::Reply(Msg {
            tag,
            body: FCall::RlError { ecode: e.errno() as u32 },
        })
    }
}

enum DispatchOutcome {
    Reply(Msg),
    Flushed,
}

#[rustfmt::skip]
async fn dispatch_once<Fs>(
    msg: &Msg,
    fs: Arc<Fs>,
    fids: &FidPool<Fs::FId>,
) -> Result<FCall>
where
    Fs: Filesystem + Send + Sync,
{
    let newfid = msg.body.newfid();

    use crate::FCall::*;
    let response = {
        let get_fid = |fid: &u32| async move { fids.find(*fid).await };

        match &msg.body {
            TStatFs { fid }                                                     => fs.rstatfs(&*get_fid(fid).await?).await,
            TlOpen { fid, flags }                                               => fs.rlopen(&*get_fid(fid).await?, *flags).await,
            TlCreate { fid, name, flags, mode, gid }                            => fs.rlcreate(&*get_fid(fid).await?, name, *flags, *mode, *gid).await,
            TSymlink { fid, name, symtgt, gid }                                 => fs.rsymlink(&*get_fid(fid).await?, name, symtgt, *gid).await,
            TMkNod { dfid, name, mode, major, minor, gid }                      => fs.rmknod(&*get_fid(dfid).await?, name, *mode, *major, *minor, *gid).await,
            TRename { fid, dfid, name }                                        => fs.rrename(&*get_fid(fid).await?, &*get_fid(dfid).await?, name).await,
            TReadLink { fid }                                                   => fs.rreadlink(&*get_fid(fid).await?).await,
            TGetAttr { fid, req_mask }                                         => fs.rgetattr(&*get_fid(fid).await?, *req_mask).await,
            TSetAttr { fid, valid, stat }                                      => fs.rsetattr(&*get_fid(fid).await?, *valid, stat).await,
            TxAttrWalk { fid, newfid: nf, name } => {
                let base = get_fid(fid).await?;
                let created = fids.create(*nf, Default::default()).await?;
                fs.rxattrwalk(&*base, &*created, name).await
            }
            TxAttrCreate { fid, name, attr_size, flags }                       => fs.rxattrcreate(&*get_fid(fid).await?, name, *attr_size, *flags).await,
            TReadDir { fid, offset, count }                                    => fs.rreaddir(&*get_fid(fid).await?, *offset, *count).await,
            TFSync { fid }                                                      => fs.rfsync(&*get_fid(fid).await?).await,
            TLock { fid, flock }                                               => fs.rlock(&*get_fid(fid).await?, flock).await,
            TGetLock { fid, flock }                                            => fs.rgetlock(&*get_fid(fid).await?, flock).await,
            TLink { dfid, fid, name }                                          => fs.rlink(&*get_fid(dfid).await?, &*get_fid(fid).await?, name).await,
            TMkDir { dfid, name, mode, gid }                                   => fs.rmkdir(&*get_fid(dfid).await?, name, *mode, *gid).await,
            TRenameAt { olddirfid, oldname, newdirfid, newname }               => fs.rrenameat(&*get_fid(olddirfid).await?, oldname, &*get_fid(newdirfid).await?, newname).await,
            TUnlinkAt { dirfd, name, flags }                                   => fs.runlinkat(&*get_fid(dirfd).await?, name, *flags).await,
            TAuth { afid: _, uname, aname, n_uname } => {
                let Some(nf) = newfid else { return Err(error::Error::No(EPROTO)); };
                let created = fids.create(nf, Default::default()).await?;
                fs.rauth(&*created, uname, aname, *n_uname).await
            }
            TAttach { fid, afid: _, uname, aname, n_uname } => {
                let created = fids.create(*fid, Default::default()).await?;
                fs.rattach(&*created, None, uname, aname, *n_uname).await
            }
            TVersion { msize, version }                                        => fs.rversion(*msize, version).await,
            TFlush { .. } => unreachable!("Tflush is handled before dispatch_once is called"),
            TWalk { fid, newfid: nf, wnames } => {
                // In-place rewalk (newfid == fid) would need to swap the fid table
                // slot while it's still live; not supported.
                if *nf == *fid {
                    return Err(error::Error::BadMessage);
                }
                let base = get_fid(fid).await?;
                let created = fids.create(*nf, Default::default()).await?;
                let result = fs.rwalk(&*base, &*created, wnames).await;
                if result.is_err() {
                    fids.decref(*nf).await;
                }
                result
            }
            TRead { fid, offset, count }                                       => fs.rread(&*get_fid(fid).await?, *offset, *count).await,
            TWrite { fid, offset, data }                                       => fs.rwrite(&*get_fid(fid).await?, *offset, data).await,
            TClunk { fid } => {
                let result = fs.rclunk(&*get_fid(fid).await?).await;
                fids.decref(*fid).await;
                result
            }
            TRemove { fid } => {
                let result = fs.rremove(&*get_fid(fid).await?).await;
                fids.decref(*fid).await;
                result
            }
            _                                                                   => return Err(error::Error::No(EOPNOTSUPP)),
        }?
    };

    Ok(response)
}
