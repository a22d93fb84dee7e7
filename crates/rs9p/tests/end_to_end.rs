//! End-to-end scenarios driving a real `Connection` over an in-process duplex pipe,
//! paired against `rs9p_client` where the scenario only needs ordinary client calls and
//! against hand-rolled frames where it needs protocol moves the client doesn't expose
//! (`Tflush`, overlapping tags on one connection).

use std::{
    collections::HashMap,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use bytes::buf::BufMut;
use rs9p::{
    connection::Connection,
    error::{self, errno::*},
    fcall::*,
    serialize,
    srv::{FId, Filesystem},
    utils::Result,
    workerpool::WorkerPool,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::Mutex,
};

struct Entry {
    path: u64,
    is_dir: bool,
    content: Vec<u8>,
}

/// A tiny in-memory backend: a flat root directory of named entries. `"slow"` never
/// answers `rread`, standing in for a backend call stuck on real I/O.
struct MemFs {
    entries: HashMap<&'static str, Entry>,
}

impl MemFs {
    fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("greeting.txt", Entry { path: 1, is_dir: false, content: b"hello world".to_vec() });
        entries.insert("slow", Entry { path: 2, is_dir: false, content: Vec::new() });
        MemFs { entries }
    }
}

#[derive(Default)]
struct MemFid {
    name: Mutex<Option<String>>,
}

fn qid_for(path: u64, is_dir: bool) -> QId {
    QId {
        typ: if is_dir { QIdType::DIR } else { QIdType::empty() },
        version: 0,
        path,
    }
}

#[async_trait]
impl Filesystem for MemFs {
    type FId = MemFid;

    async fn rattach(
        &self,
        fid: &FId<Self::FId>,
        _afid: Option<&FId<Self::FId>>,
        _uname: &str,
        _aname: &str,
        _n_uname: u32,
    ) -> Result<FCall> {
        *fid.aux.name.lock().await = None;
        Ok(FCall::RAttach { qid: qid_for(0, true) })
    }

    async fn rwalk(&self, fid: &FId<Self::FId>, new: &FId<Self::FId>, wnames: &[String]) -> Result<FCall> {
        let current = fid.aux.name.lock().await.clone();
        if current.is_some() {
            return Err(error::Error::No(ENOTDIR));
        }
        if wnames.is_empty() {
            return Ok(FCall::RWalk { wqids: Vec::new() });
        }

        // This backend is a flat directory, so only a single path element resolves.
        let name = &wnames[0];
        let Some(entry) = self.entries.get(name.as_str()) else {
            return Ok(FCall::RWalk { wqids: Vec::new() });
        };
        *new.aux.name.lock().await = Some(name.clone());
        Ok(FCall::RWalk { wqids: vec![qid_for(entry.path, entry.is_dir)] })
    }

    async fn rlopen(&self, fid: &FId<Self::FId>, _flags: u32) -> Result<FCall> {
        let name = fid.aux.name.lock().await.clone();
        let qid = match &name {
            None => qid_for(0, true),
            Some(n) => {
                let entry = self.entries.get(n.as_str()).ok_or(error::Error::No(ENOENT))?;
                qid_for(entry.path, entry.is_dir)
            }
        };
        Ok(FCall::RlOpen { qid, iounit: 0 })
    }

    async fn rread(&self, fid: &FId<Self::FId>, offset: u64, count: u32) -> Result<FCall> {
        let name = fid.aux.name.lock().await.clone();
        match name.as_deref() {
            Some("slow") => {
                // Never completes on its own; only a `Tflush` (or the connection
                // dying) moves this request forward.
                futures::future::pending::<()>().await;
                unreachable!()
            }
            Some(n) => {
                let entry = self.entries.get(n).ok_or(error::Error::No(ENOENT))?;
                let start = (offset as usize).min(entry.content.len());
                let end = (start + count as usize).min(entry.content.len());
                Ok(FCall::RRead { data: Data(entry.content[start..end].to_vec()) })
            }
            None => Err(error::Error::No(EISDIR)),
        }
    }

    async fn rreaddir(&self, fid: &FId<Self::FId>, offset: u64, _count: u32) -> Result<FCall> {
        if fid.aux.name.lock().await.is_some() {
            return Err(error::Error::No(ENOTDIR));
        }
        if offset != 0 {
            return Ok(FCall::RReadDir { data: DirEntryData { data: Vec::new() } });
        }
        let data = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, (name, entry))| DirEntry {
                qid: qid_for(entry.path, entry.is_dir),
                offset: (i + 1) as u64,
                typ: 0,
                name: name.to_string(),
            })
            .collect();
        Ok(FCall::RReadDir { data: DirEntryData { data } })
    }

    async fn rclunk(&self, _: &FId<Self::FId>) -> Result<FCall> {
        Ok(FCall::RClunk)
    }
}

async fn spawn_server(fs: MemFs) -> DuplexStream {
    let (server_side, client_side) = tokio::io::duplex(1 << 20);
    let conn = Connection::new(Arc::new(fs));
    let pool = Arc::new(WorkerPool::new(5));
    tokio::spawn(async move {
        let _ = conn.serve(server_side, pool).await;
    });
    client_side
}

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
async fn version_then_attach() {
    let mut sock = spawn_server(MemFs::new()).await;

    send_msg(&mut sock, &Msg { tag: NOTAG, body: FCall::TVersion { msize: 8192, version: P92000L.to_string() } }).await;
    let reply = recv_msg(&mut sock).await;
    match reply.body {
        FCall::RVersion { msize, version } => {
            assert_eq!(msize, 8192);
            assert_eq!(version, P92000L);
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    send_msg(&mut sock, &Msg {
        tag: 0,
        body: FCall::TAttach { fid: 0, afid: NOFID, uname: "u".to_string(), aname: "ctl".to_string(), n_uname: 0 },
    })
    .await;
    let reply = recv_msg(&mut sock).await;
    match reply.body {
        FCall::RAttach { qid } => assert!(qid.typ.contains(QIdType::DIR)),
        other => panic!("unexpected reply: {:?}", other),
    }
}

async fn negotiate_and_attach(sock: &mut DuplexStream) -> u32 {
    send_msg(sock, &Msg { tag: NOTAG, body: FCall::TVersion { msize: 8192, version: P92000L.to_string() } }).await;
    recv_msg(sock).await;
    send_msg(sock, &Msg {
        tag: 0,
        body: FCall::TAttach { fid: 0, afid: NOFID, uname: "u".to_string(), aname: "ctl".to_string(), n_uname: 0 },
    })
    .await;
    recv_msg(sock).await;
    0
}

#[tokio::test]
async fn walk_into_fresh_fid() {
    let mut sock = spawn_server(MemFs::new()).await;
    let root = negotiate_and_attach(&mut sock).await;

    send_msg(&mut sock, &Msg {
        tag: 1,
        body: FCall::TWalk { fid: root, newfid: 1, wnames: vec!["greeting.txt".to_string()] },
    })
    .await;
    let reply = recv_msg(&mut sock).await;
    match reply.body {
        FCall::RWalk { wqids } => {
            assert_eq!(wqids.len(), 1);
            assert!(!wqids[0].typ.contains(QIdType::DIR));
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn readdir_continuation_has_no_duplicates() {
    let mut sock = spawn_server(MemFs::new()).await;
    let root = negotiate_and_attach(&mut sock).await;

    send_msg(&mut sock, &Msg { tag: 1, body: FCall::TlOpen { fid: root, flags: 0 } }).await;
    recv_msg(&mut sock).await;

    send_msg(&mut sock, &Msg { tag: 2, body: FCall::TReadDir { fid: root, offset: 0, count: 4096 } }).await;
    let first = match recv_msg(&mut sock).await.body {
        FCall::RReadDir { data } => data.data,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert_eq!(first.len(), 2);
    let last_offset = first.last().unwrap().offset;

    send_msg(&mut sock, &Msg { tag: 3, body: FCall::TReadDir { fid: root, offset: last_offset, count: 4096 } }).await;
    let second = match recv_msg(&mut sock).await.body {
        FCall::RReadDir { data } => data.data,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert!(second.is_empty(), "continuation must not repeat entries");
}

#[tokio::test]
async fn flush_cancels_a_stuck_read_and_connection_stays_usable() {
    let mut sock = spawn_server(MemFs::new()).await;
    let root = negotiate_and_attach(&mut sock).await;

    send_msg(&mut sock, &Msg {
        tag: 1,
        body: FCall::TWalk { fid: root, newfid: 1, wnames: vec!["slow".to_string()] },
    })
    .await;
    recv_msg(&mut sock).await;
    send_msg(&mut sock, &Msg { tag: 2, body: FCall::TlOpen { fid: 1, flags: 0 } }).await;
    recv_msg(&mut sock).await;

    send_msg(&mut sock, &Msg { tag: 3, body: FCall::TRead { fid: 1, offset: 0, count: 1_000_000_000 } }).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    send_msg(&mut sock, &Msg { tag: 4, body: FCall::TFlush { oldtag: 3 } }).await;

    let reply = recv_msg(&mut sock).await;
    assert_eq!(reply.tag, 4);
    assert!(matches!(reply.body, FCall::RFlush));

    // The stuck Tread never answers; the connection still answers new requests.
    send_msg(&mut sock, &Msg { tag: 5, body: FCall::TClunk { fid: 1 } }).await;
    let reply = recv_msg(&mut sock).await;
    assert_eq!(reply.tag, 5);
    assert!(matches!(reply.body, FCall::RClunk));
}

#[tokio::test]
async fn concurrent_requests_keep_tag_to_reply_integrity() {
    let mut sock = spawn_server(MemFs::new()).await;
    let root = negotiate_and_attach(&mut sock).await;

    send_msg(&mut sock, &Msg {
        tag: 1,
        body: FCall::TWalk { fid: root, newfid: 1, wnames: vec!["greeting.txt".to_string()] },
    })
    .await;
    recv_msg(&mut sock).await;
    send_msg(&mut sock, &Msg { tag: 2, body: FCall::TlOpen { fid: 1, flags: 0 } }).await;
    recv_msg(&mut sock).await;

    const N: u16 = 200;
    for tag in 0..N {
        send_msg(&mut sock, &Msg { tag, body: FCall::TRead { fid: 1, offset: 0, count: 11 } }).await;
    }

    let mut seen = std::collections::HashSet::new();
    for _ in 0..N {
        let reply = recv_msg(&mut sock).await;
        assert!(matches!(reply.body, FCall::RRead { .. }));
        assert!(seen.insert(reply.tag), "tag {} answered twice", reply.tag);
    }
    assert_eq!(seen.len(), N as usize);
}

#[tokio::test]
async fn fid_leak_test_reports_unclunked_fid_on_teardown() {
    let fs = Arc::new(MemFs::new());
    let conn = Connection::new(fs);
    let pool = Arc::new(WorkerPool::new(5));
    let (server_side, mut sock) = tokio::io::duplex(1 << 20);
    let serve_conn = conn.clone();
    let server_task = tokio::spawn(async move {
        let _ = serve_conn.serve(server_side, pool).await;
    });

    send_msg(&mut sock, &Msg { tag: NOTAG, body: FCall::TVersion { msize: 8192, version: P92000L.to_string() } }).await;
    recv_msg(&mut sock).await;
    send_msg(&mut sock, &Msg {
        tag: 0,
        body: FCall::TAttach { fid: 0, afid: NOFID, uname: "u".to_string(), aname: "ctl".to_string(), n_uname: 0 },
    })
    .await;
    recv_msg(&mut sock).await;

    for i in 1..=1000u32 {
        send_msg(&mut sock, &Msg { tag: i as u16, body: FCall::TWalk { fid: 0, newfid: i, wnames: vec!["greeting.txt".to_string()] } }).await;
        recv_msg(&mut sock).await;
    }
    for i in 1..1000u32 {
        send_msg(&mut sock, &Msg { tag: i as u16, body: FCall::TClunk { fid: i } }).await;
        recv_msg(&mut sock).await;
    }

    // fid 0 (the attach fid) plus fid 1000 (never clunked) remain bound.
    assert_eq!(conn.fid_count().await, 2);

    drop(sock);
    let _ = server_task.await;
}
