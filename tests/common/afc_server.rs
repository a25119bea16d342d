//! An AFC server over an in-memory file tree

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use devicelink::afc::{
    errors::AfcError,
    opcode::AfcOpcode,
    packet::{AfcPacket, AfcPacketHeader},
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Link(String),
}

/// What the server observed, for assertions
#[derive(Debug, Default)]
pub struct Stats {
    pub requests: Vec<AfcOpcode>,
    pub packet_numbers: Vec<u64>,
    pub write_chunks: Vec<usize>,
    pub closed_fds: Vec<u64>,
}

enum Reply {
    Status(AfcError),
    Data(Vec<u8>),
    Opened(u64),
    Position(u64),
}

struct OpenFile {
    path: String,
    pos: u64,
}

pub struct MockAfc {
    pub tree: BTreeMap<String, Node>,
    fds: HashMap<u64, OpenFile>,
    next_fd: u64,
}

fn u64_at(b: &[u8], i: usize) -> u64 {
    u64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap())
}

fn c_strings(b: &[u8]) -> Vec<String> {
    b.split(|c| *c == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8(s.to_vec()).unwrap())
        .collect()
}

fn parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

fn pairs(kvs: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (k, v) in kvs {
        out.extend_from_slice(k.as_bytes());
        out.push(0);
        out.extend_from_slice(v.as_bytes());
        out.push(0);
    }
    out
}

impl Default for MockAfc {
    fn default() -> Self {
        let mut tree = BTreeMap::new();
        tree.insert("/".to_string(), Node::Dir);
        tree.insert("/DCIM".to_string(), Node::Dir);
        tree.insert("/DCIM/100APPLE".to_string(), Node::Dir);
        tree.insert(
            "/DCIM/100APPLE/IMG_0001.JPG".to_string(),
            Node::File(vec![0xff; 1234]),
        );
        tree.insert("/Downloads".to_string(), Node::Dir);
        Self {
            tree,
            fds: HashMap::new(),
            next_fd: 3,
        }
    }
}

/// Photos are read only, like the camera roll on a real device
pub const READ_ONLY_ROOT: &str = "/DCIM";

fn read_only(path: &str) -> bool {
    path == READ_ONLY_ROOT || path.starts_with(&format!("{READ_ONLY_ROOT}/"))
}

impl MockAfc {
    fn children(&self, dir: &str) -> Vec<String> {
        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        self.tree
            .keys()
            .filter(|k| k.len() > prefix.len() && k.starts_with(&prefix))
            .filter(|k| !k[prefix.len()..].contains('/'))
            .map(|k| k[prefix.len()..].to_string())
            .collect()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.tree.get(path) == Some(&Node::Dir)
    }

    fn file_mut(&mut self, fd: u64) -> Option<(&mut Vec<u8>, &mut u64)> {
        let open = self.fds.get_mut(&fd)?;
        match self.tree.get_mut(&open.path) {
            Some(Node::File(data)) => Some((data, &mut open.pos)),
            _ => None,
        }
    }

    fn handle(&mut self, op: AfcOpcode, hp: &[u8], payload: &[u8], stats: &mut Stats) -> Reply {
        use AfcError::*;
        let path = || c_strings(hp).into_iter().next().unwrap_or_default();

        match op {
            AfcOpcode::ReadDir => {
                let path = path();
                if !self.is_dir(&path) {
                    return Reply::Status(ObjectNotFound);
                }
                let mut out = b".\0..\0".to_vec();
                for c in self.children(&path) {
                    out.extend_from_slice(c.as_bytes());
                    out.push(0);
                }
                Reply::Data(out)
            }
            AfcOpcode::MakeDir => {
                let path = path();
                if read_only(&path) {
                    return Reply::Status(PermDenied);
                }
                if self.tree.contains_key(&path) {
                    return Reply::Status(ObjectExists);
                }
                if !self.is_dir(parent(&path)) {
                    return Reply::Status(ObjectNotFound);
                }
                self.tree.insert(path, Node::Dir);
                Reply::Status(Success)
            }
            AfcOpcode::GetFileInfo => {
                let (size, ifmt, target) = match self.tree.get(&path()) {
                    Some(Node::Dir) => (0, "S_IFDIR", None),
                    Some(Node::File(d)) => (d.len(), "S_IFREG", None),
                    Some(Node::Link(t)) => (t.len(), "S_IFLNK", Some(t.clone())),
                    None => return Reply::Status(ObjectNotFound),
                };
                let mut kvs = vec![
                    ("st_size", size.to_string()),
                    ("st_blocks", size.div_ceil(512).to_string()),
                    ("st_nlink", "1".to_string()),
                    ("st_ifmt", ifmt.to_string()),
                    ("st_mtime", "1700000000000000000".to_string()),
                    ("st_birthtime", "1600000000000000000".to_string()),
                ];
                if let Some(t) = target {
                    kvs.push(("st_link_target", t));
                }
                Reply::Data(pairs(&kvs))
            }
            AfcOpcode::GetDevInfo => Reply::Data(pairs(&[
                ("Model", "iPhone14,2".to_string()),
                ("FSTotalBytes", "64000000000".to_string()),
                ("FSFreeBytes", "12000000000".to_string()),
                ("FSBlockSize", "4096".to_string()),
            ])),
            AfcOpcode::FileOpen => {
                let mode = u64_at(hp, 0);
                let path = c_strings(&hp[8..]).into_iter().next().unwrap_or_default();
                if !self.is_dir(parent(&path)) {
                    return Reply::Status(ObjectNotFound);
                }
                if mode != 1 && read_only(&path) {
                    return Reply::Status(PermDenied);
                }
                let pos = match (self.tree.get_mut(&path), mode) {
                    (Some(Node::Dir), _) => return Reply::Status(ObjectIsDir),
                    (None, 1) => return Reply::Status(ObjectNotFound),
                    (Some(Node::File(d)), 3 | 4) => {
                        d.clear();
                        0
                    }
                    (Some(Node::File(d)), 5 | 6) => d.len() as u64,
                    (Some(_), _) => 0,
                    (None, _) => {
                        self.tree.insert(path.clone(), Node::File(Vec::new()));
                        0
                    }
                };
                let fd = self.next_fd;
                self.next_fd += 1;
                self.fds.insert(fd, OpenFile { path, pos });
                Reply::Opened(fd)
            }
            AfcOpcode::Read => {
                let len = u64_at(hp, 1);
                match self.file_mut(u64_at(hp, 0)) {
                    Some((data, pos)) => {
                        let start = (*pos as usize).min(data.len());
                        let end = (start + len as usize).min(data.len());
                        *pos = end as u64;
                        Reply::Data(data[start..end].to_vec())
                    }
                    None => Reply::Status(InvalidArg),
                }
            }
            AfcOpcode::Write => {
                stats.write_chunks.push(payload.len());
                match self.file_mut(u64_at(hp, 0)) {
                    Some((data, pos)) => {
                        let start = *pos as usize;
                        if data.len() < start + payload.len() {
                            data.resize(start + payload.len(), 0);
                        }
                        data[start..start + payload.len()].copy_from_slice(payload);
                        *pos += payload.len() as u64;
                        Reply::Status(Success)
                    }
                    None => Reply::Status(InvalidArg),
                }
            }
            AfcOpcode::FileSeek => {
                let whence = u64_at(hp, 1);
                let offset = u64_at(hp, 2) as i64;
                match self.file_mut(u64_at(hp, 0)) {
                    Some((data, pos)) => {
                        let base = match whence {
                            0 => 0,
                            1 => *pos as i64,
                            _ => data.len() as i64,
                        };
                        if base + offset < 0 {
                            return Reply::Status(InvalidArg);
                        }
                        *pos = (base + offset) as u64;
                        Reply::Status(Success)
                    }
                    None => Reply::Status(InvalidArg),
                }
            }
            AfcOpcode::FileTell => match self.fds.get(&u64_at(hp, 0)) {
                Some(f) => Reply::Position(f.pos),
                None => Reply::Status(InvalidArg),
            },
            AfcOpcode::FileClose => {
                let fd = u64_at(hp, 0);
                stats.closed_fds.push(fd);
                match self.fds.remove(&fd) {
                    Some(_) => Reply::Status(Success),
                    None => Reply::Status(InvalidArg),
                }
            }
            AfcOpcode::RemovePath => {
                let path = path();
                if read_only(&path) {
                    return Reply::Status(PermDenied);
                }
                if !self.tree.contains_key(&path) {
                    return Reply::Status(ObjectNotFound);
                }
                if !self.children(&path).is_empty() {
                    return Reply::Status(DirNotEmpty);
                }
                self.tree.remove(&path);
                Reply::Status(Success)
            }
            AfcOpcode::RemovePathAndContents => {
                let path = path();
                if read_only(&path) {
                    return Reply::Status(PermDenied);
                }
                if !self.tree.contains_key(&path) {
                    return Reply::Status(ObjectNotFound);
                }
                let prefix = format!("{path}/");
                self.tree
                    .retain(|k, _| k != &path && !k.starts_with(&prefix));
                Reply::Status(Success)
            }
            AfcOpcode::RenamePath => {
                let names = c_strings(hp);
                let (from, to) = (&names[0], &names[1]);
                if read_only(from) || read_only(to) {
                    return Reply::Status(PermDenied);
                }
                if !self.tree.contains_key(from) {
                    return Reply::Status(ObjectNotFound);
                }
                let prefix = format!("{from}/");
                let moved = self
                    .tree
                    .keys()
                    .filter(|k| *k == from || k.starts_with(&prefix))
                    .cloned()
                    .collect::<Vec<_>>();
                for k in moved {
                    if let Some(node) = self.tree.remove(&k) {
                        self.tree.insert(format!("{to}{}", &k[from.len()..]), node);
                    }
                }
                Reply::Status(Success)
            }
            AfcOpcode::MakeLink => {
                let names = c_strings(&hp[8..]);
                if read_only(&names[1]) {
                    return Reply::Status(PermDenied);
                }
                if self.tree.contains_key(&names[1]) {
                    return Reply::Status(ObjectExists);
                }
                self.tree
                    .insert(names[1].clone(), Node::Link(names[0].clone()));
                Reply::Status(Success)
            }
            _ => Reply::Status(OpNotSupported),
        }
    }
}

/// Serves AFC on `stream` until the client goes away
pub fn spawn(mut stream: DuplexStream, checkin: bool) -> Arc<Mutex<Stats>> {
    let stats = Arc::new(Mutex::new(Stats::default()));
    let task_stats = stats.clone();
    tokio::spawn(async move {
        if checkin {
            super::answer_checkin(&mut stream).await;
        }
        let mut afc = MockAfc::default();
        loop {
            let mut header = [0u8; AfcPacketHeader::LEN as usize];
            if stream.read_exact(&mut header).await.is_err() {
                break;
            }
            let header = AfcPacketHeader::parse(&header).unwrap();
            let mut hp = vec![0u8; (header.header_payload_len - AfcPacketHeader::LEN) as usize];
            stream.read_exact(&mut hp).await.unwrap();
            let mut payload = vec![0u8; (header.entire_len - header.header_payload_len) as usize];
            stream.read_exact(&mut payload).await.unwrap();

            let reply = {
                let mut stats = task_stats.lock().unwrap();
                stats.requests.push(header.operation);
                stats.packet_numbers.push(header.packet_num);
                afc.handle(header.operation, &hp, &payload, &mut stats)
            };
            let n = header.packet_num;
            let packet = match reply {
                Reply::Status(e) => {
                    AfcPacket::new(AfcOpcode::Status, n, e.code().to_le_bytes().to_vec(), vec![])
                }
                Reply::Data(d) => AfcPacket::new(AfcOpcode::Data, n, vec![], d),
                Reply::Opened(fd) => {
                    AfcPacket::new(AfcOpcode::FileOpenRes, n, fd.to_le_bytes().to_vec(), vec![])
                }
                Reply::Position(p) => {
                    AfcPacket::new(AfcOpcode::FileTellRes, n, p.to_le_bytes().to_vec(), vec![])
                }
            };
            if stream.write_all(&packet.serialize()).await.is_err() {
                break;
            }
        }
    });
    stats
}
