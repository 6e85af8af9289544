//! Line-oriented directory protocol shared by the tracker and the peers.
//!
//! One request per line, one response per line, fields separated by `|`.
//! Record lists use `,` between items and `'` between record fields. Raw
//! chunk payloads are not lines: they are framed as a 4-byte big-endian
//! chunk index, a 4-byte big-endian length and the payload bytes.

use thiserror::Error;

use crate::models::{FileRecord, PeerAddress};

pub const FIELD_SEPARATOR: char = '|';
pub const LIST_SEPARATOR: char = ',';
pub const RECORD_SEPARATOR: char = '\'';

/// 4-byte index + 4-byte length.
pub const CHUNK_FRAME_HEADER_LEN: usize = 8;

pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty request")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command}: expected {expected} fields, got {actual}")]
    FieldCount {
        command: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{command}: invalid number '{value}'")]
    BadNumber {
        command: &'static str,
        value: String,
    },
    #[error("{command}: declared {declared} items, found {found}")]
    CountMismatch {
        command: &'static str,
        declared: usize,
        found: usize,
    },
    #[error("{command}: malformed item '{item}'")]
    BadItem {
        command: &'static str,
        item: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { peer: PeerAddress },
    Share { record: FileRecord },
    SharePrivate {
        record: FileRecord,
        allowed: Vec<PeerAddress>,
    },
    Unshare { record: FileRecord },
    Query { keyword: String },
    Refresh { peer: PeerAddress },
    GetPeers {
        file_hash: String,
        requester: PeerAddress,
    },
    GetKnownPeers,
    Search { file_name: String },
    GetChunk { file_hash: String, index: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Registered,
    SharedList(Vec<FileRecord>),
    Refreshed(Vec<FileRecord>),
    QueryHits(Vec<FileRecord>),
    Success(String),
    Peers(Vec<PeerAddress>),
    KnownPeers(Vec<PeerAddress>),
    FileInfo(FileRecord),
    FileNotFound(String),
    NotFound(String),
    AccessDenied,
    Error(String),
}

fn parse_number<T: std::str::FromStr>(
    command: &'static str,
    value: &str,
) -> Result<T, ProtocolError> {
    value.parse::<T>().map_err(|_| ProtocolError::BadNumber {
        command,
        value: value.to_string(),
    })
}

fn expect_fields(
    command: &'static str,
    parts: &[&str],
    expected: usize,
) -> Result<(), ProtocolError> {
    if parts.len() != expected {
        return Err(ProtocolError::FieldCount {
            command,
            expected,
            actual: parts.len(),
        });
    }
    Ok(())
}

/// `name'size'hash'ip'port,name'size'hash'ip'port,...`
pub fn encode_file_records(records: &[FileRecord]) -> String {
    records
        .iter()
        .map(|r| {
            format!(
                "{}{sep}{}{sep}{}{sep}{}{sep}{}",
                r.file_name,
                r.file_size,
                r.file_hash,
                r.owner.ip,
                r.owner.port,
                sep = RECORD_SEPARATOR
            )
        })
        .collect::<Vec<String>>()
        .join(&LIST_SEPARATOR.to_string())
}

pub fn parse_file_records(
    command: &'static str,
    declared: usize,
    list: &str,
) -> Result<Vec<FileRecord>, ProtocolError> {
    if declared == 0 {
        return Ok(vec![]);
    }
    let mut records = vec![];
    for item in list.split(LIST_SEPARATOR) {
        let fields = item.split(RECORD_SEPARATOR).collect::<Vec<&str>>();
        if fields.len() != 5 {
            return Err(ProtocolError::BadItem {
                command,
                item: item.to_string(),
            });
        }
        records.push(FileRecord::new(
            fields[0],
            parse_number::<u64>(command, fields[1])?,
            fields[2],
            PeerAddress::new(fields[3], parse_number::<u16>(command, fields[4])?),
        ));
    }
    if records.len() != declared {
        return Err(ProtocolError::CountMismatch {
            command,
            declared,
            found: records.len(),
        });
    }
    Ok(records)
}

/// `ip'port,ip'port,...`
pub fn encode_peer_list(peers: &[PeerAddress]) -> String {
    peers
        .iter()
        .map(|p| format!("{}{}{}", p.ip, RECORD_SEPARATOR, p.port))
        .collect::<Vec<String>>()
        .join(&LIST_SEPARATOR.to_string())
}

pub fn parse_peer_list(
    command: &'static str,
    declared: usize,
    list: &str,
) -> Result<Vec<PeerAddress>, ProtocolError> {
    if declared == 0 {
        return Ok(vec![]);
    }
    let mut peers = vec![];
    for item in list.split(LIST_SEPARATOR) {
        let fields = item.split(RECORD_SEPARATOR).collect::<Vec<&str>>();
        if fields.len() != 2 {
            return Err(ProtocolError::BadItem {
                command,
                item: item.to_string(),
            });
        }
        peers.push(PeerAddress::new(
            fields[0],
            parse_number::<u16>(command, fields[1])?,
        ));
    }
    if peers.len() != declared {
        return Err(ProtocolError::CountMismatch {
            command,
            declared,
            found: peers.len(),
        });
    }
    Ok(peers)
}

/// `ip:port,ip:port,...` — only `GET_KNOWN_PEERS` uses the colon form.
fn encode_endpoint_list(peers: &[PeerAddress]) -> String {
    peers
        .iter()
        .map(|p| p.endpoint())
        .collect::<Vec<String>>()
        .join(&LIST_SEPARATOR.to_string())
}

fn parse_endpoint_list(
    command: &'static str,
    declared: usize,
    list: &str,
) -> Result<Vec<PeerAddress>, ProtocolError> {
    if declared == 0 {
        return Ok(vec![]);
    }
    let mut peers = vec![];
    for item in list.split(LIST_SEPARATOR) {
        let Some((ip, port)) = item.rsplit_once(':') else {
            return Err(ProtocolError::BadItem {
                command,
                item: item.to_string(),
            });
        };
        peers.push(PeerAddress::new(ip, parse_number::<u16>(command, port)?));
    }
    if peers.len() != declared {
        return Err(ProtocolError::CountMismatch {
            command,
            declared,
            found: peers.len(),
        });
    }
    Ok(peers)
}

fn parse_record_fields(
    command: &'static str,
    parts: &[&str],
) -> Result<FileRecord, ProtocolError> {
    Ok(FileRecord::new(
        parts[0],
        parse_number::<u64>(command, parts[1])?,
        parts[2],
        PeerAddress::new(parts[3], parse_number::<u16>(command, parts[4])?),
    ))
}

impl Request {
    pub fn parse(line: &str) -> Result<Request, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let parts = line.split(FIELD_SEPARATOR).collect::<Vec<&str>>();
        match parts[0] {
            "REGISTER" => {
                expect_fields("REGISTER", &parts, 3)?;
                Ok(Request::Register {
                    peer: PeerAddress::new(parts[1], parse_number("REGISTER", parts[2])?),
                })
            }
            "SHARE" => {
                expect_fields("SHARE", &parts, 6)?;
                Ok(Request::Share {
                    record: parse_record_fields("SHARE", &parts[1..])?,
                })
            }
            "SHARE_TO_PEERS" => {
                expect_fields("SHARE_TO_PEERS", &parts, 8)?;
                let record = parse_record_fields("SHARE_TO_PEERS", &parts[1..6])?;
                let count = parse_number::<usize>("SHARE_TO_PEERS", parts[6])?;
                let allowed = parse_peer_list("SHARE_TO_PEERS", count, parts[7])?;
                Ok(Request::SharePrivate { record, allowed })
            }
            "UNSHARED_FILE" => {
                expect_fields("UNSHARED_FILE", &parts, 6)?;
                Ok(Request::Unshare {
                    record: parse_record_fields("UNSHARED_FILE", &parts[1..])?,
                })
            }
            "QUERY" => {
                expect_fields("QUERY", &parts, 2)?;
                Ok(Request::Query {
                    keyword: parts[1].to_string(),
                })
            }
            "REFRESH" => {
                expect_fields("REFRESH", &parts, 3)?;
                Ok(Request::Refresh {
                    peer: PeerAddress::new(parts[1], parse_number("REFRESH", parts[2])?),
                })
            }
            "GET_PEERS" => {
                expect_fields("GET_PEERS", &parts, 4)?;
                Ok(Request::GetPeers {
                    file_hash: parts[1].to_string(),
                    requester: PeerAddress::new(parts[2], parse_number("GET_PEERS", parts[3])?),
                })
            }
            "GET_KNOWN_PEERS" => {
                expect_fields("GET_KNOWN_PEERS", &parts, 1)?;
                Ok(Request::GetKnownPeers)
            }
            "SEARCH" => {
                expect_fields("SEARCH", &parts, 2)?;
                Ok(Request::Search {
                    file_name: parts[1].to_string(),
                })
            }
            "GET_CHUNK" => {
                expect_fields("GET_CHUNK", &parts, 3)?;
                Ok(Request::GetChunk {
                    file_hash: parts[1].to_string(),
                    index: parse_number("GET_CHUNK", parts[2])?,
                })
            }
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Request::Register { peer } => format!("REGISTER|{}|{}", peer.ip, peer.port),
            Request::Share { record } => format!(
                "SHARE|{}|{}|{}|{}|{}",
                record.file_name,
                record.file_size,
                record.file_hash,
                record.owner.ip,
                record.owner.port
            ),
            Request::SharePrivate { record, allowed } => format!(
                "SHARE_TO_PEERS|{}|{}|{}|{}|{}|{}|{}",
                record.file_name,
                record.file_size,
                record.file_hash,
                record.owner.ip,
                record.owner.port,
                allowed.len(),
                encode_peer_list(allowed)
            ),
            Request::Unshare { record } => format!(
                "UNSHARED_FILE|{}|{}|{}|{}|{}",
                record.file_name,
                record.file_size,
                record.file_hash,
                record.owner.ip,
                record.owner.port
            ),
            Request::Query { keyword } => format!("QUERY|{}", keyword),
            Request::Refresh { peer } => format!("REFRESH|{}|{}", peer.ip, peer.port),
            Request::GetPeers {
                file_hash,
                requester,
            } => format!("GET_PEERS|{}|{}|{}", file_hash, requester.ip, requester.port),
            Request::GetKnownPeers => "GET_KNOWN_PEERS".to_string(),
            Request::Search { file_name } => format!("SEARCH|{}", file_name),
            Request::GetChunk { file_hash, index } => {
                format!("GET_CHUNK|{}|{}", file_hash, index)
            }
        }
    }
}

impl Response {
    pub fn parse(line: &str) -> Result<Response, ProtocolError> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }
        let parts = line.split(FIELD_SEPARATOR).collect::<Vec<&str>>();
        match parts[0] {
            "REGISTERED" => Ok(Response::Registered),
            "SHARED_LIST" => {
                expect_fields("SHARED_LIST", &parts, 3)?;
                let count = parse_number::<usize>("SHARED_LIST", parts[1])?;
                Ok(Response::SharedList(parse_file_records(
                    "SHARED_LIST",
                    count,
                    parts[2],
                )?))
            }
            "REFRESHED" => {
                expect_fields("REFRESHED", &parts, 3)?;
                let count = parse_number::<usize>("REFRESHED", parts[1])?;
                Ok(Response::Refreshed(parse_file_records(
                    "REFRESHED",
                    count,
                    parts[2],
                )?))
            }
            "QUERY" => {
                expect_fields("QUERY", &parts, 3)?;
                let count = parse_number::<usize>("QUERY", parts[1])?;
                Ok(Response::QueryHits(parse_file_records(
                    "QUERY", count, parts[2],
                )?))
            }
            "SUCCESS" => Ok(Response::Success(parts[1..].join("|"))),
            "GET_PEERS" => {
                expect_fields("GET_PEERS", &parts, 3)?;
                let count = parse_number::<usize>("GET_PEERS", parts[1])?;
                Ok(Response::Peers(parse_peer_list("GET_PEERS", count, parts[2])?))
            }
            "GET_KNOWN_PEERS" => {
                expect_fields("GET_KNOWN_PEERS", &parts, 3)?;
                let count = parse_number::<usize>("GET_KNOWN_PEERS", parts[1])?;
                Ok(Response::KnownPeers(parse_endpoint_list(
                    "GET_KNOWN_PEERS",
                    count,
                    parts[2],
                )?))
            }
            "FILE_INFO" => {
                expect_fields("FILE_INFO", &parts, 6)?;
                Ok(Response::FileInfo(FileRecord::new(
                    parts[1],
                    parse_number::<u64>("FILE_INFO", parts[2])?,
                    parts[5],
                    PeerAddress::new(parts[3], parse_number::<u16>("FILE_INFO", parts[4])?),
                )))
            }
            "FILE_NOT_FOUND" => {
                expect_fields("FILE_NOT_FOUND", &parts, 2)?;
                Ok(Response::FileNotFound(parts[1].to_string()))
            }
            "NOT_FOUND" => Ok(Response::NotFound(parts[1..].join("|"))),
            "ACCESS_DENIED" => Ok(Response::AccessDenied),
            "ERROR" => Ok(Response::Error(parts[1..].join("|"))),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }

    pub fn to_line(&self) -> String {
        match self {
            Response::Registered => "REGISTERED".to_string(),
            Response::SharedList(records) => format!(
                "SHARED_LIST|{}|{}",
                records.len(),
                encode_file_records(records)
            ),
            Response::Refreshed(records) => format!(
                "REFRESHED|{}|{}",
                records.len(),
                encode_file_records(records)
            ),
            Response::QueryHits(records) => {
                format!("QUERY|{}|{}", records.len(), encode_file_records(records))
            }
            Response::Success(msg) => {
                if msg.is_empty() {
                    "SUCCESS".to_string()
                } else {
                    format!("SUCCESS|{}", msg)
                }
            }
            Response::Peers(peers) => {
                format!("GET_PEERS|{}|{}", peers.len(), encode_peer_list(peers))
            }
            Response::KnownPeers(peers) => format!(
                "GET_KNOWN_PEERS|{}|{}",
                peers.len(),
                encode_endpoint_list(peers)
            ),
            Response::FileInfo(record) => format!(
                "FILE_INFO|{}|{}|{}|{}|{}",
                record.file_name,
                record.file_size,
                record.owner.ip,
                record.owner.port,
                record.file_hash
            ),
            Response::FileNotFound(name) => format!("FILE_NOT_FOUND|{}", name),
            Response::NotFound(reason) => format!("NOT_FOUND|{}", reason),
            Response::AccessDenied => "ACCESS_DENIED".to_string(),
            Response::Error(reason) => format!("ERROR|{}", reason),
        }
    }
}
