//! ICY (Shoutcast/Icecast) metadata interleaving.
//!
//! A server that honours `Icy-MetaData: 1` answers with an `Icy-MetaInt: N` header and
//! then sends N audio bytes, one length byte `L`, `L * 16` bytes of metadata text, N
//! audio bytes again, and so on. [`IcyReader`] strips the metadata blocks so decoders
//! only ever see audio, and reports title changes through a callback.

use std::io::{self, Read};
use std::sync::LazyLock;

use regex::Regex;

use crate::config::HttpSettings;
use crate::error::SourceError;
use crate::metadata::StreamMetaData;

/// Request header asking the server to interleave metadata.
pub const ICY_REQUEST_HEADER: &str = "Icy-MetaData";
/// Response header carrying the metadata interval.
pub const ICY_METAINT_HEADER: &str = "icy-metaint";

const READ_AHEAD: usize = 4096;

static STREAM_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)StreamTitle='(.*?)';(StreamUrl='(.*?)';?)?").expect("valid regex")
});

/// Raw fields of one metadata block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IcyBlock {
    pub stream_title: String,
    pub stream_url: String,
}

impl IcyBlock {
    /// Artist/track come from `artist=`/`title=` query parameters of `StreamUrl` when
    /// present, otherwise from the title itself.
    pub fn to_stream_metadata(&self) -> StreamMetaData {
        let (artist, track) = query_artist_title(&self.stream_url);
        StreamMetaData::new(
            artist.as_deref(),
            track.as_deref(),
            self.stream_title.clone(),
            self.stream_url.clone(),
        )
    }
}

/// Parse the text of one block. NUL padding is ignored; a block without
/// `StreamTitle` yields `None`.
pub fn parse_metadata_block(bytes: &[u8]) -> Option<IcyBlock> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_end_matches('\0');
    let caps = STREAM_TITLE.captures(text)?;
    Some(IcyBlock {
        stream_title: caps.get(1).map(|m| m.as_str().to_string()).unwrap_or_default(),
        stream_url: caps.get(3).map(|m| m.as_str().to_string()).unwrap_or_default(),
    })
}

/// Read one length-prefixed block from `reader`.
///
/// Returns `Ok(None)` on end of stream, on an empty block, or when the block has no
/// `StreamTitle`.
pub fn read_metadata_block<R: Read>(reader: &mut R) -> io::Result<Option<IcyBlock>> {
    let mut len = [0u8; 1];
    if !read_full(reader, &mut len)? {
        return Ok(None);
    }
    let block_len = len[0] as usize * 16;
    if block_len == 0 {
        return Ok(None);
    }
    let mut block = vec![0u8; block_len];
    if !read_full(reader, &mut block)? {
        return Ok(None);
    }
    Ok(parse_metadata_block(&block))
}

/// Parse an `Icy-MetaInt` header value. Zero or garbage means "no interleaving".
pub fn parse_meta_int(value: Option<&str>) -> Option<usize> {
    value
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|v| *v > 0)
}

fn query_artist_title(url: &str) -> (Option<String>, Option<String>) {
    let query = url.split_once('?').map(|(_, q)| q).unwrap_or(url);
    let mut artist = None;
    let mut title = None;
    for pair in query.split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = value.replace('+', " ");
        let value = urlencoding::decode(&value)
            .map(|v| v.into_owned())
            .unwrap_or(value);
        match key.to_ascii_lowercase().as_str() {
            "artist" => artist = Some(value),
            "title" => title = Some(value),
            _ => {}
        }
    }
    (artist, title)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Ok(false),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

type TitleCallback = Box<dyn FnMut(StreamMetaData) + Send>;

/// Read-ahead reader that removes interleaved ICY metadata from an audio byte stream.
pub struct IcyReader<R> {
    inner: R,
    meta_int: Option<usize>,
    until_meta: usize,
    buf: Box<[u8]>,
    pos: usize,
    len: usize,
    last_title: Option<String>,
    on_title: Option<TitleCallback>,
}

impl<R: Read> IcyReader<R> {
    /// `meta_int` of `None` disables stripping: every byte is audio.
    pub fn new(inner: R, meta_int: Option<usize>) -> Self {
        Self {
            inner,
            meta_int,
            until_meta: meta_int.unwrap_or(0),
            buf: vec![0u8; READ_AHEAD].into_boxed_slice(),
            pos: 0,
            len: 0,
            last_title: None,
            on_title: None,
        }
    }

    /// Invoke `callback` whenever a block carries a title different from the last one.
    pub fn on_title_change(mut self, callback: impl FnMut(StreamMetaData) + Send + 'static) -> Self {
        self.on_title = Some(Box::new(callback));
        self
    }

    pub fn meta_int(&self) -> Option<usize> {
        self.meta_int
    }

    pub fn last_title(&self) -> Option<&str> {
        self.last_title.as_deref()
    }

    /// Make sure the read-ahead buffer holds at least one byte. `false` at end of stream.
    fn fill(&mut self) -> io::Result<bool> {
        if self.pos < self.len {
            return Ok(true);
        }
        loop {
            match self.inner.read(&mut self.buf) {
                Ok(0) => return Ok(false),
                Ok(n) => {
                    self.pos = 0;
                    self.len = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn read_buffered(&mut self, out: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < out.len() {
            if !self.fill()? {
                return Ok(false);
            }
            let n = (self.len - self.pos).min(out.len() - filled);
            out[filled..filled + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            filled += n;
        }
        Ok(true)
    }

    /// Consume one metadata block. `false` at end of stream.
    fn consume_metadata(&mut self) -> io::Result<bool> {
        let mut len = [0u8; 1];
        if !self.read_buffered(&mut len)? {
            return Ok(false);
        }
        let block_len = len[0] as usize * 16;
        if block_len == 0 {
            return Ok(true);
        }
        let mut block = vec![0u8; block_len];
        if !self.read_buffered(&mut block)? {
            return Ok(false);
        }
        if let Some(parsed) = parse_metadata_block(&block) {
            self.observe(parsed);
        }
        Ok(true)
    }

    fn observe(&mut self, block: IcyBlock) {
        if self.last_title.as_deref() == Some(block.stream_title.as_str()) {
            return;
        }
        self.last_title = Some(block.stream_title.clone());
        if let Some(cb) = self.on_title.as_mut() {
            cb(block.to_stream_metadata());
        }
    }
}

impl<R: Read> Read for IcyReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < out.len() {
            if let Some(meta_int) = self.meta_int {
                if self.until_meta == 0 {
                    if !self.consume_metadata()? {
                        break;
                    }
                    self.until_meta = meta_int;
                    continue;
                }
            }
            if !self.fill()? {
                break;
            }
            let mut n = (self.len - self.pos).min(out.len() - written);
            if self.meta_int.is_some() {
                n = n.min(self.until_meta);
            }
            out[written..written + n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            written += n;
            if self.meta_int.is_some() {
                self.until_meta -= n;
            }
        }
        Ok(written)
    }
}

/// Open a fresh connection, skip one interval of audio and read the first metadata block.
///
/// Returns `Ok(None)` when the server does not interleave metadata or the block carries
/// no title.
pub fn poll_stream_metadata(
    url: &str,
    http: &HttpSettings,
) -> Result<Option<StreamMetaData>, SourceError> {
    let resp = ureq::get(url)
        .config()
        .timeout_connect(Some(http.connect_timeout))
        .timeout_recv_response(Some(http.response_timeout))
        .timeout_recv_body(Some(http.response_timeout))
        .build()
        .header(ICY_REQUEST_HEADER, "1")
        .header("User-Agent", &http.user_agent)
        .call()?;
    let meta_int = parse_meta_int(
        resp.headers()
            .get(ICY_METAINT_HEADER)
            .and_then(|v| v.to_str().ok()),
    );
    let Some(meta_int) = meta_int else {
        return Ok(None);
    };
    let (_, body) = resp.into_parts();
    let mut reader = body.into_reader();
    let skipped = io::copy(&mut (&mut reader).take(meta_int as u64), &mut io::sink())?;
    if skipped < meta_int as u64 {
        return Ok(None);
    }
    let block = read_metadata_block(&mut reader)?;
    Ok(block.map(|b| b.to_stream_metadata()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    fn block(text: &str) -> Vec<u8> {
        let blocks = text.len().div_ceil(16);
        let mut out = vec![blocks as u8];
        out.extend_from_slice(text.as_bytes());
        out.resize(1 + blocks * 16, 0);
        out
    }

    /// Reader that hands out at most `step` bytes per call.
    struct Trickle {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn parses_title_and_url_from_padded_block() {
        let text = "StreamTitle='Artist - Track';StreamUrl='u';";
        let mut bytes = vec![0x19u8];
        bytes.extend_from_slice(text.as_bytes());
        bytes.resize(1 + 400, 0);

        let parsed = read_metadata_block(&mut Cursor::new(bytes)).unwrap().unwrap();
        assert_eq!(parsed.stream_title, "Artist - Track");
        assert_eq!(parsed.stream_url, "u");
    }

    #[test]
    fn block_without_title_yields_nothing() {
        assert!(parse_metadata_block(b"StreamUrl='x';\0\0").is_none());
        assert!(read_metadata_block(&mut Cursor::new(vec![0u8])).unwrap().is_none());
    }

    #[test]
    fn url_query_overrides_title_split() {
        let parsed = IcyBlock {
            stream_title: "Whatever - Here".into(),
            stream_url: "http://x/?artist=Daft%20Punk&title=One+More+Time".into(),
        };
        let meta = parsed.to_stream_metadata();
        assert_eq!(meta.meta.artist.as_deref(), Some("Daft Punk"));
        assert_eq!(meta.meta.track.as_deref(), Some("One More Time"));
    }

    #[test]
    fn meta_int_header_parsing() {
        assert_eq!(parse_meta_int(Some("16000")), Some(16000));
        assert_eq!(parse_meta_int(Some(" 8192 ")), Some(8192));
        assert_eq!(parse_meta_int(Some("0")), None);
        assert_eq!(parse_meta_int(Some("abc")), None);
        assert_eq!(parse_meta_int(None), None);
    }

    #[test]
    fn strips_metadata_and_reports_changes_once() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[1u8; 8]);
        wire.extend(block("StreamTitle='A - B';"));
        wire.extend_from_slice(&[2u8; 8]);
        wire.extend(block("StreamTitle='A - B';"));
        wire.extend_from_slice(&[3u8; 8]);
        wire.push(0);
        wire.extend_from_slice(&[4u8; 5]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut reader = IcyReader::new(Trickle { data: Cursor::new(wire), step: 3 }, Some(8))
            .on_title_change(move |meta| sink.lock().unwrap().push(meta.to_string()));

        let mut audio = Vec::new();
        reader.read_to_end(&mut audio).unwrap();

        let mut expected = vec![1u8; 8];
        expected.extend_from_slice(&[2u8; 8]);
        expected.extend_from_slice(&[3u8; 8]);
        expected.extend_from_slice(&[4u8; 5]);
        assert_eq!(audio, expected);
        assert_eq!(*seen.lock().unwrap(), vec!["A - B".to_string()]);
        assert_eq!(reader.last_title(), Some("A - B"));
    }

    #[test]
    fn read_fills_request_across_short_reads() {
        let data: Vec<u8> = (0..100u8).collect();
        let mut reader = IcyReader::new(Trickle { data: Cursor::new(data), step: 7 }, None);
        let mut out = [0u8; 50];
        assert_eq!(reader.read(&mut out).unwrap(), 50);
        assert_eq!(out[49], 49);
    }

    #[test]
    fn without_meta_int_bytes_pass_through() {
        let data = b"StreamTitle='not metadata';".to_vec();
        let mut reader = IcyReader::new(Cursor::new(data.clone()), None);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }
}
