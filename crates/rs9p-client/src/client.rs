//! High-level client operations: the `npc_mount`/`npc_walk`/`npc_open`/... surface of
//! the original client library, rebuilt atop [`crate::connection::ClientConnection`].

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use rs9p::{
    error::{self, errno::*},
    fcall::*,
    utils::Result,
};

use crate::{connection::ClientConnection, fidpool::FidPool};

/// Maximum path components carried in one `Twalk`, per the wire format.
const MAX_WELEM: usize = 16;

/// Default `msize` offered during `Tversion` if the caller doesn't have an opinion.
pub const DEFAULT_MSIZE: u32 = 1024 * 1024;

/// One negotiated 9P2000.L session.
pub struct Client {
    conn: Arc<ClientConnection>,
    fids: FidPool,
}

impl Client {
    /// Connect and negotiate `Tversion`. Does not attach to a filesystem tree; call
    /// [`Client::attach`] (or use [`mount`]) next.
    pub async fn connect(addr: &str, msize: u32) -> Result<Arc<Client>> {
        let conn = ClientConnection::dial(addr).await?;
        Self::negotiate(conn, msize).await
    }

    /// Negotiate over an already-established transport, the way [`Client::connect`]
    /// negotiates over a dialed address. Exercised directly by this module's tests via
    /// an in-process duplex pipe.
    #[cfg(test)]
    pub async fn connect_over<T: rs9p::transport::Transport>(transport: T, msize: u32) -> Result<Arc<Client>> {
        let conn = ClientConnection::new(transport).await?;
        Self::negotiate(conn, msize).await
    }

    async fn negotiate(conn: Arc<ClientConnection>, msize: u32) -> Result<Arc<Client>> {
        match conn.version(msize, P92000L).await? {
            FCall::RVersion { version, .. } if version == P92000L => {}
            FCall::RVersion { .. } => return Err(error::Error::BadVersion),
            _ => return Err(error::Error::BadMessage),
        }

        Ok(Arc::new(Client { conn, fids: FidPool::new() }))
    }

    /// Negotiated `msize`, valid once [`Client::connect`] has returned.
    pub fn msize(&self) -> u32 {
        self.conn.msize()
    }

    /// `Tattach` to `aname` as `uname`/`n_uname`. A session can attach more than once
    /// (distinct fids, possibly distinct anames) without reconnecting.
    pub async fn attach(self: &Arc<Self>, aname: &str, uname: &str, n_uname: u32) -> Result<ClientFid> {
        let fid = self.fids.alloc().await;
        let reply = self
            .conn
            .rpc(FCall::TAttach {
                fid,
                afid: NOFID,
                uname: uname.to_string(),
                aname: aname.to_string(),
                n_uname,
            })
            .await;

        match reply {
            Ok(FCall::RAttach { qid }) => Ok(ClientFid::new(fid, qid, 0, self.clone())),
            Ok(_) => {
                self.fids.free(fid).await;
                Err(error::Error::BadMessage)
            }
            Err(e) => {
                self.fids.free(fid).await;
                Err(e)
            }
        }
    }

    /// Best-effort graceful disconnect: half-closes the transport. Any fid handles the
    /// caller is still holding become useless afterward.
    pub async fn umount(&self) {
        self.conn.close().await;
    }

    pub(crate) async fn clunk_fid(&self, fid: u32) -> Result<()> {
        let result = self.conn.rpc(FCall::TClunk { fid }).await;
        self.fids.free(fid).await;
        match result {
            Ok(FCall::RClunk) => Ok(()),
            Ok(_) => Err(error::Error::BadMessage),
            Err(e) => Err(e),
        }
    }
}

/// Connect, negotiate, and attach in one call — the combined `npc_mount`/`npc_netmount`
/// convenience entry point.
pub async fn mount(addr: &str, msize: u32, aname: &str, uname: &str, n_uname: u32) -> Result<(Arc<Client>, ClientFid)> {
    let client = Client::connect(addr, msize).await?;
    let root = client.attach(aname, uname, n_uname).await?;
    Ok((client, root))
}

/// A fid bound on this session: `Npcfid`'s counterpart.
pub struct ClientFid {
    fid: u32,
    pub qid: QId,
    pub iounit: u32,
    offset: AtomicU64,
    client: Arc<Client>,
}

impl ClientFid {
    fn new(fid: u32, qid: QId, iounit: u32, client: Arc<Client>) -> Self {
        ClientFid { fid, qid, iounit, offset: AtomicU64::new(0), client }
    }

    pub fn fid(&self) -> u32 {
        self.fid
    }

    /// Walk `path` (`/`-separated, possibly empty for a no-op clone of this fid) to a
    /// freshly allocated fid. Intermediate fids are always distinct from `self` and
    /// from each other, so a failure partway through never disturbs the caller's own
    /// fid and never asks the server to walk a fid onto itself.
    pub async fn walk(&self, path: &str) -> Result<ClientFid> {
        let names: Vec<String> = path.split('/').filter(|s| !s.is_empty()).map(String::from).collect();

        if names.is_empty() {
            return self.walk_clone().await;
        }

        let mut cur_fid = self.fid;
        let mut cur_is_intermediate = false;
        let mut qid = self.qid;

        for chunk in names.chunks(MAX_WELEM) {
            let newfid = self.client.fids.alloc().await;
            let reply = self
                .client
                .conn
                .rpc(FCall::TWalk { fid: cur_fid, newfid, wnames: chunk.to_vec() })
                .await;

            let wqids = match reply {
                Ok(FCall::RWalk { wqids }) => wqids,
                Ok(_) => {
                    self.client.fids.free(newfid).await;
                    if cur_is_intermediate {
                        let _ = self.client.clunk_fid(cur_fid).await;
                    }
                    return Err(error::Error::BadMessage);
                }
                Err(e) => {
                    self.client.fids.free(newfid).await;
                    if cur_is_intermediate {
                        let _ = self.client.clunk_fid(cur_fid).await;
                    }
                    return Err(e);
                }
            };

            let resolved = wqids.len() == chunk.len();
            if let Some(&last) = wqids.last() {
                qid = last;
            }

            if cur_is_intermediate {
                let _ = self.client.clunk_fid(cur_fid).await;
            }

            if !resolved {
                // newfid exists server-side with a partial result; we don't want it.
                let _ = self.client.clunk_fid(newfid).await;
                return Err(error::Error::No(ENOENT));
            }

            cur_fid = newfid;
            cur_is_intermediate = true;
        }

        Ok(ClientFid::new(cur_fid, qid, 0, self.client.clone()))
    }

    async fn walk_clone(&self) -> Result<ClientFid> {
        let newfid = self.client.fids.alloc().await;
        let reply = self
            .client
            .conn
            .rpc(FCall::TWalk { fid: self.fid, newfid, wnames: Vec::new() })
            .await;

        match reply {
            Ok(FCall::RWalk { .. }) => Ok(ClientFid::new(newfid, self.qid, self.iounit, self.client.clone())),
            Ok(_) => {
                self.client.fids.free(newfid).await;
                Err(error::Error::BadMessage)
            }
            Err(e) => {
                self.client.fids.free(newfid).await;
                Err(e)
            }
        }
    }

    pub async fn open(&mut self, flags: u32) -> Result<()> {
        match self.client.conn.rpc(FCall::TlOpen { fid: self.fid, flags }).await? {
            FCall::RlOpen { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                Ok(())
            }
            _ => Err(error::Error::BadMessage),
        }
    }

    pub async fn create(&mut self, name: &str, flags: u32, mode: u32, gid: u32) -> Result<()> {
        match self
            .client
            .conn
            .rpc(FCall::TlCreate { fid: self.fid, name: name.to_string(), flags, mode, gid })
            .await?
        {
            FCall::RlCreate { qid, iounit } => {
                self.qid = qid;
                self.iounit = iounit;
                Ok(())
            }
            _ => Err(error::Error::BadMessage),
        }
    }

    pub async fn mkdir(&self, name: &str, mode: u32, gid: u32) -> Result<QId> {
        match self
            .client
            .conn
            .rpc(FCall::TMkDir { dfid: self.fid, name: name.to_string(), mode, gid })
            .await?
        {
            FCall::RMkDir { qid } => Ok(qid),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// Read `count` bytes at `offset`. Returns fewer than `count` bytes at EOF.
    pub async fn read(&self, offset: u64, count: u32) -> Result<Vec<u8>> {
        match self.client.conn.rpc(FCall::TRead { fid: self.fid, offset, count }).await? {
            FCall::RRead { data } => Ok(data.0),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// Read starting from this fid's internal sequential offset, advancing it by the
    /// number of bytes actually returned.
    pub async fn read_next(&self, count: u32) -> Result<Vec<u8>> {
        let offset = self.offset.load(Ordering::Acquire);
        let data = self.read(offset, count).await?;
        self.offset.fetch_add(data.len() as u64, Ordering::AcqRel);
        Ok(data)
    }

    /// Read until `buf` is full or the file is exhausted, mirroring `npc_readn`'s
    /// retry-on-short-read loop.
    pub async fn read_exact_or_eof(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len as usize);
        let mut pos = offset;
        while (out.len() as u32) < len {
            let chunk = self.read(pos, len - out.len() as u32).await?;
            if chunk.is_empty() {
                break;
            }
            pos += chunk.len() as u64;
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<u32> {
        match self.client.conn.rpc(FCall::TWrite { fid: self.fid, offset, data: Data(data) }).await? {
            FCall::RWrite { count } => Ok(count),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// Write starting from this fid's internal sequential offset, advancing it by the
    /// number of bytes the server reports written.
    pub async fn write_next(&self, data: Vec<u8>) -> Result<u32> {
        let offset = self.offset.load(Ordering::Acquire);
        let count = self.write(offset, data).await?;
        self.offset.fetch_add(count as u64, Ordering::AcqRel);
        Ok(count)
    }

    /// Retry until every byte of `data` is confirmed written, mirroring `npc_writen`.
    pub async fn write_all(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < data.len() {
            let count = self.write(pos, data[written..].to_vec()).await?;
            if count == 0 {
                return Err(error::Error::No(EIO));
            }
            written += count as usize;
            pos += count as u64;
        }
        Ok(())
    }

    pub async fn readdir(&self, offset: u64, count: u32) -> Result<Vec<DirEntry>> {
        match self.client.conn.rpc(FCall::TReadDir { fid: self.fid, offset, count }).await? {
            FCall::RReadDir { data } => Ok(data.data),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// Read every directory entry by paging through `Treaddir` with `page`-byte chunks
    /// until a page comes back empty.
    pub async fn readdir_all(&self, page: u32) -> Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        let mut offset = 0u64;
        loop {
            let page_entries = self.readdir(offset, page).await?;
            if page_entries.is_empty() {
                break;
            }
            offset = page_entries.last().map(|e| e.offset).unwrap_or(offset);
            entries.extend(page_entries);
        }
        Ok(entries)
    }

    pub async fn getattr(&self, mask: GetAttrMask) -> Result<(GetAttrMask, QId, rs9p::Stat)> {
        match self.client.conn.rpc(FCall::TGetAttr { fid: self.fid, req_mask: mask }).await? {
            FCall::RGetAttr { valid, qid, stat } => Ok((valid, qid, stat)),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// `stat`, by convention requesting every attribute the wire format carries.
    pub async fn stat(&self) -> Result<rs9p::Stat> {
        self.getattr(GetAttrMask::all()).await.map(|(_, _, stat)| stat)
    }

    pub async fn setattr(&self, valid: SetAttrMask, attr: SetAttr) -> Result<()> {
        match self.client.conn.rpc(FCall::TSetAttr { fid: self.fid, valid, stat: attr }).await? {
            FCall::RSetAttr => Ok(()),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// `wstat`, the 9P2000.L equivalent being a `Tsetattr` over every field `valid`
    /// names (there's no separate `Twstat` message in this protocol version).
    pub async fn wstat(&self, valid: SetAttrMask, attr: SetAttr) -> Result<()> {
        self.setattr(valid, attr).await
    }

    pub async fn statfs(&self) -> Result<StatFs> {
        match self.client.conn.rpc(FCall::TStatFs { fid: self.fid }).await? {
            FCall::RStatFs { statfs } => Ok(statfs),
            _ => Err(error::Error::BadMessage),
        }
    }

    pub async fn fsync(&self) -> Result<()> {
        match self.client.conn.rpc(FCall::TFSync { fid: self.fid }).await? {
            FCall::RFSync => Ok(()),
            _ => Err(error::Error::BadMessage),
        }
    }

    /// `Tremove`: remove the file and clunk the fid (the protocol performs both in one
    /// round trip, successful or not).
    pub async fn remove(self) -> Result<()> {
        let fid = self.fid;
        let result = self.client.conn.rpc(FCall::TRemove { fid }).await;
        self.client.fids.free(fid).await;
        match result {
            Ok(FCall::RRemove) => Ok(()),
            Ok(_) => Err(error::Error::BadMessage),
            Err(e) => Err(e),
        }
    }

    pub async fn clunk(self) -> Result<()> {
        self.client.clunk_fid(self.fid).await
    }
}

/// Walk `path` from `root` and `stat` it, clunking the intermediate fid either way —
/// the `npc_stat` convenience (walk, operate, close).
pub async fn stat_path(root: &ClientFid, path: &str) -> Result<rs9p::Stat> {
    let fid = root.walk(path).await?;
    let result = fid.stat().await;
    let _ = fid.clunk().await;
    result
}

/// Walk `path` from `root` and apply `setattr`, clunking the intermediate fid either
/// way — the `npc_wstat` convenience.
pub async fn wstat_path(root: &ClientFid, path: &str, valid: SetAttrMask, attr: SetAttr) -> Result<()> {
    let fid = root.walk(path).await?;
    let result = fid.setattr(valid, attr).await;
    let _ = fid.clunk().await;
    result
}

/// Walk `path` from `root` and remove it — the `npc_remove` convenience.
pub async fn remove_path(root: &ClientFid, path: &str) -> Result<()> {
    let fid = root.walk(path).await?;
    fid.remove().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::buf::BufMut;
    use rs9p::serialize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

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

    fn qid(path: u64) -> QId {
        QId { typ: QIdType::DIR, version: 0, path }
    }

    #[tokio::test]
    async fn attach_binds_root_fid() {
        let (client_side, mut responder) = tokio::io::duplex(64 * 1024);
        let conn_task = tokio::spawn(async move {
            let req = recv_msg(&mut responder).await;
            assert!(matches!(req.body, FCall::TVersion { .. }));
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RVersion { msize: 8192, version: P92000L.to_string() } }).await;

            let req = recv_msg(&mut responder).await;
            match req.body {
                FCall::TAttach { fid, afid, ref uname, ref aname, n_uname } => {
                    assert_eq!(afid, NOFID);
                    assert_eq!(uname, "nobody");
                    assert_eq!(aname, "");
                    assert_eq!(n_uname, 0);
                    send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RAttach { qid: qid(1) } }).await;
                    fid
                }
                _ => panic!("expected TAttach"),
            }
        });

        let client = Client::connect_over(client_side, DEFAULT_MSIZE).await.unwrap();
        let root = client.attach("", "nobody", 0).await.unwrap();
        assert_eq!(root.qid.path, 1);

        let attached_fid = conn_task.await.unwrap();
        assert_eq!(attached_fid, root.fid());
    }

    #[tokio::test]
    async fn walk_open_read_clunk_round_trip() {
        let (client_side, mut responder) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let req = recv_msg(&mut responder).await;
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RVersion { msize: 8192, version: P92000L.to_string() } }).await;

            let req = recv_msg(&mut responder).await;
            let root_fid = match req.body {
                FCall::TAttach { fid, .. } => fid,
                _ => panic!("expected TAttach"),
            };
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RAttach { qid: qid(1) } }).await;

            let req = recv_msg(&mut responder).await;
            let walked_fid = match req.body {
                FCall::TWalk { fid, newfid, ref wnames } => {
                    assert_eq!(fid, root_fid);
                    assert_ne!(newfid, fid, "walk must never target the source fid");
                    assert_eq!(wnames, &["greeting.txt".to_string()]);
                    newfid
                }
                _ => panic!("expected TWalk"),
            };
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RWalk { wqids: vec![qid(2)] } }).await;

            let req = recv_msg(&mut responder).await;
            match req.body {
                FCall::TlOpen { fid, flags } => {
                    assert_eq!(fid, walked_fid);
                    assert_eq!(flags, 0);
                }
                _ => panic!("expected TlOpen"),
            }
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RlOpen { qid: qid(2), iounit: 0 } }).await;

            let req = recv_msg(&mut responder).await;
            match req.body {
                FCall::TRead { fid, offset, count } => {
                    assert_eq!(fid, walked_fid);
                    assert_eq!(offset, 0);
                    assert_eq!(count, 64);
                }
                _ => panic!("expected TRead"),
            }
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RRead { data: Data(b"hello".to_vec()) } }).await;

            let req = recv_msg(&mut responder).await;
            match req.body {
                FCall::TClunk { fid } => assert_eq!(fid, walked_fid),
                _ => panic!("expected TClunk"),
            }
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RClunk }).await;
        });

        let client = Client::connect_over(client_side, DEFAULT_MSIZE).await.unwrap();
        let root = client.attach("", "nobody", 0).await.unwrap();
        let mut file = root.walk("greeting.txt").await.unwrap();
        file.open(0).await.unwrap();
        let data = file.read(0, 64).await.unwrap();
        assert_eq!(data, b"hello");
        file.clunk().await.unwrap();

        server.await.unwrap();
    }

    #[tokio::test]
    async fn walk_partial_resolution_clunks_bound_newfid() {
        let (client_side, mut responder) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let req = recv_msg(&mut responder).await;
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RVersion { msize: 8192, version: P92000L.to_string() } }).await;

            let req = recv_msg(&mut responder).await;
            let root_fid = match req.body {
                FCall::TAttach { fid, .. } => fid,
                _ => panic!("expected TAttach"),
            };
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RAttach { qid: qid(1) } }).await;

            let req = recv_msg(&mut responder).await;
            let bound_fid = match req.body {
                FCall::TWalk { fid, newfid, ref wnames } => {
                    assert_eq!(fid, root_fid);
                    assert_eq!(wnames.len(), 2);
                    newfid
                }
                _ => panic!("expected TWalk"),
            };
            // Only the first element resolves: the server still binds `newfid`.
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RWalk { wqids: vec![qid(3)] } }).await;

            let req = recv_msg(&mut responder).await;
            match req.body {
                FCall::TClunk { fid } => assert_eq!(fid, bound_fid),
                _ => panic!("expected a Tclunk for the partially bound fid"),
            }
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RClunk }).await;
        });

        let client = Client::connect_over(client_side, DEFAULT_MSIZE).await.unwrap();
        let root = client.attach("", "nobody", 0).await.unwrap();
        let err = root.walk("missing/child").await.unwrap_err();
        assert!(matches!(err, error::Error::No(ENOENT)));

        server.await.unwrap();
    }

    #[tokio::test]
    async fn readdir_all_pages_until_empty() {
        let (client_side, mut responder) = tokio::io::duplex(64 * 1024);
        let server = tokio::spawn(async move {
            let req = recv_msg(&mut responder).await;
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RVersion { msize: 8192, version: P92000L.to_string() } }).await;

            let req = recv_msg(&mut responder).await;
            send_msg(&mut responder, &Msg { tag: req.tag, body: FCall::RAttach { qid: qid(1) } }).await;

            let req = recv_msg(&mut responder).await;
            assert!(matches!(req.body, FCall::TReadDir { offset: 0, .. }));
            send_msg(&mut responder, &Msg {
                tag: req.tag,
                body: FCall::RReadDir {
                    data: DirEntryData {
                        data: vec![DirEntry { qid: qid(10), offset: 1, typ: 0, name: "a".to_string() }],
                    },
                },
            })
            .await;

            let req = recv_msg(&mut responder).await;
            assert!(matches!(req.body, FCall::TReadDir { offset: 1, .. }));
            send_msg(&mut responder, &Msg {
                tag: req.tag,
                body: FCall::RReadDir { data: DirEntryData { data: Vec::new() } },
            })
            .await;
        });

        let client = Client::connect_over(client_side, DEFAULT_MSIZE).await.unwrap();
        let root = client.attach("", "nobody", 0).await.unwrap();
        let entries = root.readdir_all(4096).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");

        server.await.unwrap();
    }
}
