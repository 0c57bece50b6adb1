use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use symphonia::core::probe::Hint;

use crate::config::EngineConfig;
use crate::decode::{AudioSource, StreamSpec, SymphoniaSource, UnseekableSource};
use crate::error::SourceError;
use crate::icy::{ICY_METAINT_HEADER, ICY_REQUEST_HEADER, IcyReader, parse_meta_int, poll_stream_metadata};
use crate::station::{PlaybackState, SourceContext, StationKind, StationSource};

use super::try_lock;

/// A live HTTP(S) stream, usually Icecast or Shoutcast.
pub struct NetworkStation {
    url: String,
    poll_lock: Mutex<()>,
    /// Token of the connection currently carrying in-band metadata, 0 for none.
    inband: Arc<AtomicU64>,
    connections: AtomicU64,
}

impl NetworkStation {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            poll_lock: Mutex::new(()),
            inband: Arc::new(AtomicU64::new(0)),
            connections: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn has_inband_metadata(&self) -> bool {
        self.inband.load(Ordering::Acquire) != 0
    }

    /// Record whether a new connection carries in-band metadata. The returned guard
    /// clears the flag on drop unless a newer connection has claimed it since.
    fn claim_inband(&self, inband: bool) -> InbandGuard {
        let token = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        self.inband
            .store(if inband { token } else { 0 }, Ordering::Release);
        InbandGuard {
            inband: self.inband.clone(),
            token,
        }
    }
}

struct InbandGuard {
    inband: Arc<AtomicU64>,
    token: u64,
}

impl Drop for InbandGuard {
    fn drop(&mut self) {
        let _ = self
            .inband
            .compare_exchange(self.token, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

/// The decoded stream of one connection. Dropping it ends that connection's claim on
/// in-band metadata.
struct NetworkSource {
    inner: SymphoniaSource,
    _inband: InbandGuard,
}

impl AudioSource for NetworkSource {
    fn spec(&self) -> StreamSpec {
        self.inner.spec()
    }

    fn total_time(&self) -> Option<Duration> {
        None
    }

    fn position(&self) -> Duration {
        self.inner.position()
    }

    fn seek(&mut self, _to: Duration) -> Result<(), SourceError> {
        Err(SourceError::Seek("live stream".into()))
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, SourceError> {
        self.inner.next_chunk()
    }
}

/// Container extension handed to the demuxer probe.
///
/// The `Content-Type` header wins, then the URL path extension, then MP3.
pub fn container_extension(content_type: Option<&str>, url: &str) -> &'static str {
    let mime = content_type
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase());
    match mime.as_deref() {
        Some("audio/mpeg" | "audio/mp3" | "audio/mpeg3") => return "mp3",
        Some("audio/ogg" | "application/ogg" | "audio/vorbis") => return "ogg",
        Some("audio/flac" | "audio/x-flac") => return "flac",
        Some("audio/aac" | "audio/aacp" | "audio/x-aac") => return "aac",
        _ => {}
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "ogg" | "oga" => "ogg",
        "flac" => "flac",
        "aac" => "aac",
        _ => "mp3",
    }
}

impl StationSource for NetworkStation {
    fn kind(&self) -> StationKind {
        StationKind::Network
    }

    fn always_sleep_when_full(&self) -> bool {
        false
    }

    fn meta_sync_interval(&self, config: &EngineConfig) -> Duration {
        config.network_meta_interval
    }

    fn open(&self, ctx: &SourceContext) -> Result<Box<dyn AudioSource>, SourceError> {
        let http = &ctx.config().http;
        let resp = ureq::get(self.url.as_str())
            .config()
            .timeout_connect(Some(http.connect_timeout))
            .timeout_recv_response(Some(http.response_timeout))
            .build()
            .header(ICY_REQUEST_HEADER, "1")
            .header("User-Agent", &http.user_agent)
            .call()?;
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type = header("content-type");
        let meta_int = parse_meta_int(header(ICY_METAINT_HEADER).as_deref());
        let extension = container_extension(content_type.as_deref(), &self.url);
        tracing::info!(
            station = %ctx.station_name(),
            url = %self.url,
            content_type = content_type.as_deref().unwrap_or("-"),
            meta_int = ?meta_int,
            "stream connected"
        );

        let (_, body) = resp.into_parts();
        let publisher = ctx.clone();
        let reader = IcyReader::new(body.into_reader(), meta_int).on_title_change(move |meta| {
            publisher.publish(Some(meta.into()));
        });
        let guard = self.claim_inband(meta_int.is_some());

        let mut hint = Hint::new();
        hint.with_extension(extension);
        let inner =
            SymphoniaSource::from_media_source(Box::new(UnseekableSource::new(reader)), hint)?;
        Ok(Box::new(NetworkSource {
            inner,
            _inband: guard,
        }))
    }

    fn refresh_meta_info(&self, ctx: &SourceContext) {
        if ctx.state() == PlaybackState::Stopped || self.has_inband_metadata() {
            return;
        }
        let Some(_guard) = try_lock(&self.poll_lock) else {
            return;
        };
        match poll_stream_metadata(&self.url, &ctx.config().http) {
            Ok(Some(meta)) => {
                ctx.publish(Some(meta.into()));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(station = %ctx.station_name(), url = %self.url, "metadata poll failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::RecordingLogger;
    use crate::station::tests::test_radio;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve one ICY response with a 16-byte metadata interval, then close.
    fn serve_once(title: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let text = format!("StreamTitle='{title}';");
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 0 {
                if line == "\r\n" {
                    break;
                }
                line.clear();
            }
            let blocks = text.len().div_ceil(16);
            let mut body = vec![0xAAu8; 16];
            body.push(blocks as u8);
            body.extend_from_slice(text.as_bytes());
            body.resize(17 + blocks * 16, 0);
            let head = "HTTP/1.1 200 OK\r\ncontent-type: audio/mpeg\r\nicy-metaint: 16\r\nconnection: close\r\n\r\n";
            stream.write_all(head.as_bytes()).unwrap();
            stream.write_all(&body).unwrap();
        });
        format!("http://{addr}/stream")
    }

    fn context() -> SourceContext {
        SourceContext::new("Live FM", test_radio(Arc::new(RecordingLogger::default())))
    }

    #[test]
    fn container_hint_prefers_content_type() {
        assert_eq!(container_extension(Some("audio/ogg"), "http://x/live.mp3"), "ogg");
        assert_eq!(container_extension(Some("audio/aacp; charset=x"), "http://x/"), "aac");
        assert_eq!(container_extension(None, "http://x/live.flac?token=1"), "flac");
        assert_eq!(container_extension(Some("application/octet-stream"), "http://x/live"), "mp3");
        assert_eq!(container_extension(None, "http://radio.example.com:8000/"), "mp3");
    }

    #[test]
    fn poll_is_skipped_while_stopped() {
        let station = NetworkStation::new(serve_once("Ignored - Title"));
        let ctx = context();
        station.refresh_meta_info(&ctx);
        assert!(ctx.current_metadata().is_none());
    }

    #[test]
    fn poll_publishes_the_stream_title() {
        let station = NetworkStation::new(serve_once("Daft Punk - One More Time"));
        let ctx = context();
        ctx.set_state_for_test(PlaybackState::Playing);
        station.refresh_meta_info(&ctx);
        let meta = ctx.current_metadata().unwrap();
        assert_eq!(meta.display(), "Daft Punk - One More Time");
    }

    #[test]
    fn poll_is_skipped_with_inband_metadata() {
        let station = NetworkStation::new(serve_once("Ignored - Title"));
        let guard = station.claim_inband(true);
        let ctx = context();
        ctx.set_state_for_test(PlaybackState::Playing);
        station.refresh_meta_info(&ctx);
        assert!(ctx.current_metadata().is_none());
        drop(guard);
        assert!(!station.has_inband_metadata());
    }

    #[test]
    fn finished_connection_keeps_a_newer_inband_claim() {
        let station = NetworkStation::new("http://127.0.0.1:9/");
        let old = station.claim_inband(true);
        let new = station.claim_inband(true);
        drop(old);
        assert!(station.has_inband_metadata());
        drop(new);
        assert!(!station.has_inband_metadata());

        let old = station.claim_inband(true);
        let plain = station.claim_inband(false);
        assert!(!station.has_inband_metadata());
        drop(old);
        drop(plain);
        assert!(!station.has_inband_metadata());
    }

    #[test]
    fn unreachable_stream_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        drop(listener);
        let station = NetworkStation::new(url);
        let err = station.open(&context()).err().unwrap();
        assert!(matches!(err, SourceError::Network(_) | SourceError::Io(_)), "{err:?}");
    }
}
