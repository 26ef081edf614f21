use crate::crypto::MessageMac;
use crate::ids::{parse_chunk_count, parse_chunk_index, parse_replication_degree};
use crate::keys::{CHUNK_KEY_ALIAS, MAC_KEY_ALIAS};
use crate::{
    ChunkCipher, ChunkKey, CodecError, Envelope, FileId, KeyProvider, Message, MessageKind,
    PeerId, Version, CHUNK_SIZE,
};
use std::fmt::Write as _;
use std::net::SocketAddr;

const CRLF: &str = "\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const MAC_SEPARATOR: &[u8] = b"\r\n\r\n";
const MAC_HEX_LEN: usize = 64;

/// Whether trailing header fields beyond a type's layout are tolerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    Strict,
    Lenient,
}

/// Frames, authenticates and encrypts protocol messages.
///
/// Layout of a datagram:
///
/// ```text
/// TYPE VERSION SENDER [fields..]\r\n
/// [ip:port\r\n]                       (GETCHUNK only)
/// \r\n
/// [body]
/// \r\n\r\n
/// <hex HMAC-SHA256 of every preceding byte>
/// ```
#[derive(Clone)]
pub struct WireCodec {
    mac: MessageMac,
    cipher: ChunkCipher,
    mode: ParseMode,
}

impl WireCodec {
    pub fn new(keys: &dyn KeyProvider) -> Result<Self, CodecError> {
        Ok(Self {
            mac: MessageMac::from_provider(keys, MAC_KEY_ALIAS)?,
            cipher: ChunkCipher::from_provider(keys, CHUNK_KEY_ALIAS)?,
            mode: ParseMode::Strict,
        })
    }

    pub fn with_mode(mut self, mode: ParseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let kind = envelope.message.kind();
        let mut header = format!("{} {} {}", kind.as_str(), envelope.version, envelope.sender);
        let mut second_line = None;
        let body = match &envelope.message {
            Message::PutChunk {
                chunk,
                replication_degree,
                body,
            } => {
                let _ = write!(header, " {} {} {}", chunk.file_id, chunk.chunk_no, replication_degree);
                self.seal_chunk(body)?
            }
            Message::Chunk { chunk, body } => {
                let _ = write!(header, " {} {}", chunk.file_id, chunk.chunk_no);
                self.seal_chunk(body)?
            }
            Message::Stored { chunk } | Message::Removed { chunk } => {
                let _ = write!(header, " {} {}", chunk.file_id, chunk.chunk_no);
                Vec::new()
            }
            Message::GetChunk { chunk, callback } => {
                let _ = write!(header, " {} {}", chunk.file_id, chunk.chunk_no);
                second_line = callback.map(|addr| addr.to_string());
                Vec::new()
            }
            Message::Delete { file_id } | Message::Deleted { file_id } => {
                let _ = write!(header, " {file_id}");
                Vec::new()
            }
            Message::Started => Vec::new(),
            Message::Retrieve { file_name } => file_name.as_bytes().to_vec(),
            Message::Info {
                file_id,
                chunk_count,
                replication_degree,
                file_name,
            } => {
                let _ = write!(header, " {file_id} {chunk_count} {replication_degree}");
                file_name.as_bytes().to_vec()
            }
        };

        header.push_str(CRLF);
        if let Some(line) = second_line {
            header.push_str(&line);
            header.push_str(CRLF);
        }
        header.push_str(CRLF);

        let mut out = Vec::with_capacity(header.len() + body.len() + MAC_SEPARATOR.len() + MAC_HEX_LEN);
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(MAC_SEPARATOR);
        let tag = self.mac.tag_hex(&out);
        out.extend_from_slice(tag.as_bytes());
        Ok(out)
    }

    /// Validates and decodes a datagram. Fails closed on any deviation.
    pub fn parse(&self, datagram: &[u8]) -> Result<Envelope, CodecError> {
        let signed = self.authenticate(datagram)?;
        let Some(split) = find(signed, HEADER_TERMINATOR) else {
            return Err(CodecError::MissingTerminator);
        };
        let header = std::str::from_utf8(&signed[..split]).map_err(|_| CodecError::MalformedHeader)?;
        if !header.bytes().all(|b| b == b'\r' || b == b'\n' || (0x20..0x7f).contains(&b)) {
            return Err(CodecError::MalformedHeader);
        }
        let body = &signed[split + HEADER_TERMINATOR.len()..];

        let mut lines = header.split(CRLF);
        let first = lines.next().unwrap_or_default();
        let extra_lines: Vec<&str> = lines.collect();

        let fields: Vec<&str> = first.split_ascii_whitespace().collect();
        let tag = fields.first().copied().unwrap_or_default();
        let kind = MessageKind::from_tag(tag).ok_or_else(|| CodecError::UnknownType(tag.to_string()))?;
        let expected = kind.field_count();
        if fields.len() < expected || (fields.len() > expected && self.mode == ParseMode::Strict) {
            return Err(CodecError::FieldCount {
                kind: kind.as_str(),
                expected,
                found: fields.len(),
            });
        }

        let version: Version = fields[1].parse()?;
        let sender: PeerId = fields[2].parse()?;

        let allowed_lines = usize::from(kind == MessageKind::GetChunk);
        if extra_lines.len() > allowed_lines && self.mode == ParseMode::Strict {
            return Err(CodecError::UnexpectedHeaderLine);
        }
        if !matches!(
            kind,
            MessageKind::PutChunk | MessageKind::Chunk | MessageKind::Retrieve | MessageKind::Info
        ) && !body.is_empty()
        {
            return Err(CodecError::UnexpectedBody(kind.as_str()));
        }

        let message = match kind {
            MessageKind::PutChunk => Message::PutChunk {
                chunk: chunk_key(fields[3], fields[4])?,
                replication_degree: parse_replication_degree(fields[5])?,
                body: self.open_chunk(body)?,
            },
            MessageKind::Stored => Message::Stored {
                chunk: chunk_key(fields[3], fields[4])?,
            },
            MessageKind::GetChunk => Message::GetChunk {
                chunk: chunk_key(fields[3], fields[4])?,
                callback: match extra_lines.first() {
                    Some(line) => Some(
                        line.trim()
                            .parse::<SocketAddr>()
                            .map_err(|_| CodecError::InvalidCallback(line.to_string()))?,
                    ),
                    None => None,
                },
            },
            MessageKind::Chunk => Message::Chunk {
                chunk: chunk_key(fields[3], fields[4])?,
                body: self.open_chunk(body)?,
            },
            MessageKind::Delete => Message::Delete {
                file_id: fields[3].parse()?,
            },
            MessageKind::Deleted => Message::Deleted {
                file_id: fields[3].parse()?,
            },
            MessageKind::Removed => Message::Removed {
                chunk: chunk_key(fields[3], fields[4])?,
            },
            MessageKind::Started => Message::Started,
            MessageKind::Retrieve => Message::Retrieve {
                file_name: file_name(body)?,
            },
            MessageKind::Info => Message::Info {
                file_id: fields[3].parse()?,
                chunk_count: parse_chunk_count(fields[4])?,
                replication_degree: parse_replication_degree(fields[5])?,
                file_name: file_name(body)?,
            },
        };

        Ok(Envelope {
            version,
            sender,
            message,
        })
    }

    fn authenticate<'a>(&self, datagram: &'a [u8]) -> Result<&'a [u8], CodecError> {
        if datagram.len() < MAC_HEX_LEN + MAC_SEPARATOR.len() {
            return Err(CodecError::MissingMac);
        }
        let (covered, tag_hex) = datagram.split_at(datagram.len() - MAC_HEX_LEN);
        if !covered.ends_with(MAC_SEPARATOR) {
            return Err(CodecError::MissingMac);
        }
        let mut tag = [0u8; MAC_HEX_LEN / 2];
        hex::decode_to_slice(tag_hex, &mut tag).map_err(|_| CodecError::MissingMac)?;
        if !self.mac.verify(covered, &tag) {
            return Err(CodecError::MacMismatch);
        }
        Ok(&covered[..covered.len() - MAC_SEPARATOR.len()])
    }

    fn seal_chunk(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        if body.len() > CHUNK_SIZE {
            return Err(CodecError::BodyTooLarge(body.len()));
        }
        self.cipher.seal(body)
    }

    fn open_chunk(&self, body: &[u8]) -> Result<Vec<u8>, CodecError> {
        let plain = self.cipher.open(body)?;
        if plain.len() > CHUNK_SIZE {
            return Err(CodecError::BodyTooLarge(plain.len()));
        }
        Ok(plain)
    }
}

fn chunk_key(file_id: &str, chunk_no: &str) -> Result<ChunkKey, CodecError> {
    Ok(ChunkKey::new(file_id.parse::<FileId>()?, parse_chunk_index(chunk_no)?))
}

fn file_name(body: &[u8]) -> Result<String, CodecError> {
    match std::str::from_utf8(body) {
        Ok(name) if !name.is_empty() && !name.contains(['/', '\\', '\0']) => Ok(name.to_string()),
        _ => Err(CodecError::InvalidFileName),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
