use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use smtp::{pump, spam_reply, Flow, PhaseTracker, RelayEnd, Tap, INTERNAL_ERROR_REPLY};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::audit::AuditLog;
use crate::error::{error_report, FilterError};
use crate::provider::RuleProvider;
use crate::rules::Verdict;

/// How long an injected reply is given to reach the client before the
/// sockets are closed.
const REPLY_FLUSH_PAUSE: Duration = Duration::from_millis(100);

/// Shared by every session the server spawns.
pub struct SessionContext {
    pub provider: Arc<RuleProvider>,
    pub audit: Arc<dyn AuditLog>,
    pub snippet_len: usize,
}

impl SessionContext {
    fn upstream_addr(&self) -> &str {
        &self.provider.config().server.upstream_addr
    }
}

/// One proxied client connection. Sees every relayed chunk through [`Tap`].
pub struct Session {
    id: String,
    ctx: Arc<SessionContext>,
    tracker: PhaseTracker,
    transcript: Option<Vec<u8>>,
    rejection: Option<(Verdict, u16)>,
}

impl Session {
    pub fn new(id: String, ctx: Arc<SessionContext>) -> Self {
        let transcript = ctx.provider.snapshot().audit_enabled().then(Vec::new);
        Session {
            id,
            ctx,
            tracker: PhaseTracker::new(),
            transcript,
            rejection: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn record(&mut self, tag: &[u8], chunk: &[u8]) {
        if let Some(transcript) = &mut self.transcript {
            transcript.extend_from_slice(tag);
            transcript.extend_from_slice(chunk);
        }
    }

    fn message_id(&self) -> String {
        String::from_utf8_lossy(self.tracker.message_id()).into_owned()
    }

    async fn relay(&mut self, client: &mut TcpStream) -> Result<RelayEnd, FilterError> {
        let mut upstream = TcpStream::connect(self.ctx.upstream_addr()).await?;
        debug!(session = %self.id, upstream = %self.ctx.upstream_addr(), "connected upstream");
        pump(client, &mut upstream, self).await
    }

    async fn write_transcript(&self, prefix: &[u8], suffix: &[u8]) {
        let Some(transcript) = &self.transcript else {
            return;
        };
        let contents = [prefix, &transcript[..], suffix].concat();
        match self.ctx.audit.transcript(&self.id, &contents).await {
            Ok(path) => info!(session = %self.id, msg_id = %self.message_id(), %path, "smtp_log written"),
            Err(e) => error!(session = %self.id, error = %e, "failed to write transcript"),
        }
    }

    async fn on_closed(&self) {
        info!(session = %self.id, "session closed");
        if self.ctx.provider.snapshot().debug_level >= 2 {
            self.write_transcript(b"", b"").await;
        }
    }

    async fn on_rejected(&self, client: &mut TcpStream) {
        let (summary, code) = match &self.rejection {
            Some((verdict, code)) => (verdict.to_string(), *code),
            None => (String::new(), self.ctx.provider.snapshot().reject_code),
        };
        let reply = spam_reply(code);
        send_reply(client, &reply).await;
        info!(session = %self.id, verdict = %summary, code, "rejected message");
        if self.ctx.provider.snapshot().debug_level >= 1 {
            self.write_transcript(b"", &reply).await;
        }
    }

    async fn on_error(&self, client: &mut TcpStream, err: FilterError) {
        send_reply(client, INTERNAL_ERROR_REPLY).await;
        let report = error_report(&err);
        error!(session = %self.id, error = %report, "session failed");
        if self.ctx.provider.snapshot().debug_level >= 0 {
            self.write_transcript(format!("{}\r\n", report).as_bytes(), b"")
                .await;
        }
    }
}

#[async_trait]
impl Tap for Session {
    type Error = FilterError;

    async fn client_chunk(
        &mut self,
        chunk: &[u8],
        forward: &mut BytesMut,
    ) -> Result<Flow, FilterError> {
        self.record(b"R: ", chunk);
        self.tracker.rewrite(chunk, &self.id, forward);

        let Some(message) = self.tracker.observe(chunk) else {
            return Ok(Flow::Continue);
        };

        let snapshot = self.ctx.provider.snapshot();
        let verdict = snapshot.classify(&message, self.ctx.snippet_len);
        verdict.log(&self.id);

        if verdict.is_spam() {
            if snapshot.debug_level >= 1 {
                if let Err(e) = self
                    .ctx
                    .audit
                    .spam(&self.id, &message.body, &verdict.to_string())
                    .await
                {
                    error!(session = %self.id, error = %e, "failed to write spam evidence");
                }
            }
            self.rejection = Some((verdict, snapshot.reject_code));
            return Ok(Flow::Intercept);
        }

        if snapshot.debug_level >= 2 {
            if let Err(e) = self.ctx.audit.decoded(&self.id, &message.body).await {
                error!(session = %self.id, error = %e, "failed to write decoded message");
            }
        }
        Ok(Flow::Continue)
    }

    fn upstream_chunk(&mut self, chunk: &[u8]) {
        self.record(b"S: ", chunk);
    }
}

/// Proxies one accepted client connection to the upstream until it ends.
/// Every failure is contained here and answered with a reply to the client.
pub async fn handle_connection(mut client: TcpStream, ctx: Arc<SessionContext>) {
    let mut session = Session::new(Ulid::new().to_string(), ctx);
    debug!(session = %session.id(), peer = ?client.peer_addr().ok(), "session started");

    match session.relay(&mut client).await {
        Ok(RelayEnd::Closed) => session.on_closed().await,
        Ok(RelayEnd::Intercepted) => session.on_rejected(&mut client).await,
        Err(e) => session.on_error(&mut client, e).await,
    }
}

async fn send_reply(client: &mut TcpStream, reply: &[u8]) {
    if let Err(e) = client.write_all(reply).await {
        warn!(error = %e, "failed to send reply to client");
        return;
    }
    tokio::time::sleep(REPLY_FLUSH_PAUSE).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::FsAuditLog;
    use camino::Utf8PathBuf;
    use smtp::DATA_TERMINATOR;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const SPAM_BODY: &[u8] = b"Message-ID: <spam-1@example.net>\r\n\
                               Subject: Sunglasses Deal\r\n\
                               \r\n\
                               <a href=\"http://example.net\">cheap</a>\r\n.\r\n";

    struct Harness {
        _tmp: tempfile::TempDir,
        audit_dir: Utf8PathBuf,
        ctx: Arc<SessionContext>,
    }

    async fn harness(upstream_addr: &str, debug_level: i8) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).unwrap();
        let config = root.join("config.toml");
        let audit_dir = root.join("audit");
        std::fs::write(
            &config,
            format!(
                r#"
[server]
listen_addr = "127.0.0.1:0"
upstream_addr = "{upstream_addr}"

[rules]
reject_code = 550
debug_level = {debug_level}
blacklist_body = [['href=', 'Sunglasses', 'Deal']]
"#
            ),
        )
        .unwrap();

        let provider = Arc::new(RuleProvider::load(&config).await.unwrap());
        let ctx = Arc::new(SessionContext {
            provider,
            audit: Arc::new(FsAuditLog::new(&audit_dir)),
            snippet_len: crate::rules::SNIPPET_LEN,
        });
        Harness {
            _tmp: tmp,
            audit_dir,
            ctx,
        }
    }

    /// Accepts one proxied connection and hands it to `handle_connection`.
    async fn spawn_proxy(ctx: Arc<SessionContext>) -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            handle_connection(socket, ctx).await;
        });
        (addr, handle)
    }

    fn audit_files(dir: &camino::Utf8Path, prefix: &str) -> Vec<String> {
        match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .filter(|name| name.starts_with(prefix))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_spam_is_rejected_and_terminator_withheld() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let upstream_task = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            socket.write_all(b"220 upstream ready\r\n").await.unwrap();
            let mut received = Vec::new();
            let _ = socket.read_to_end(&mut received).await;
            received
        });

        let h = harness(&upstream_addr, 1).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        let mut greeting = [0u8; 20];
        client.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"220 upstream ready\r\n");

        client.write_all(b"DATA\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(SPAM_BODY).await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"550 SPAM checker was invoked.\r\n");

        proxy.await.unwrap();
        let received = upstream_task.await.unwrap();
        assert!(!received.ends_with(DATA_TERMINATOR));

        assert_eq!(audit_files(&h.audit_dir, "spam_").len(), 1);
        assert_eq!(audit_files(&h.audit_dir, "smtp_").len(), 1);
        assert!(audit_files(&h.audit_dir, "sdec_").is_empty());
    }

    #[tokio::test]
    async fn test_local_resubmission_is_not_classified() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let upstream_task = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(DATA_TERMINATOR) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client side closed early");
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(b"250 queued\r\n").await.unwrap();
            let _ = socket.read_to_end(&mut received).await;
            received
        });

        let h = harness(&upstream_addr, 2).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        client
            .write_all(b"XFORWARD NAME=localhost ADDR=127.0.0.1 SOURCE=LOCAL\r\n")
            .await
            .unwrap();
        client.write_all(b"DATA\r\n").await.unwrap();
        client.write_all(SPAM_BODY).await.unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"250 queued\r\n");
        client.shutdown().await.unwrap();

        proxy.await.unwrap();
        let received = upstream_task.await.unwrap();
        assert!(received.ends_with(DATA_TERMINATOR));
        assert!(audit_files(&h.audit_dir, "spam_").is_empty());
        assert!(audit_files(&h.audit_dir, "sdec_").is_empty());
        // Normal close with debug level 2 keeps the transcript.
        assert_eq!(audit_files(&h.audit_dir, "smtp_").len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_close_reaches_client() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let upstream_task = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            socket.write_all(b"421 going away\r\n").await.unwrap();
        });

        let h = harness(&upstream_addr, 0).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"421 going away\r\n");

        upstream_task.await.unwrap();
        proxy.await.unwrap();
        assert!(audit_files(&h.audit_dir, "smtp_").is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_gets_internal_error() {
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = unused.local_addr().unwrap().to_string();
        drop(unused);

        let h = harness(&upstream_addr, 0).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, INTERNAL_ERROR_REPLY);

        proxy.await.unwrap();
        assert_eq!(audit_files(&h.audit_dir, "smtp_").len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_reset_gets_internal_error() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let upstream_task = tokio::spawn(async move {
            let (socket, _) = upstream.accept().await.unwrap();
            socket.set_linger(Some(Duration::ZERO)).unwrap();
            drop(socket);
        });

        let h = harness(&upstream_addr, 0).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        upstream_task.await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, INTERNAL_ERROR_REPLY);

        proxy.await.unwrap();
        assert_eq!(audit_files(&h.audit_dir, "smtp_").len(), 1);
    }

    #[tokio::test]
    async fn test_trace_header_reaches_upstream_only() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let upstream_task = tokio::spawn(async move {
            let (mut socket, _) = upstream.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.ends_with(DATA_TERMINATOR) {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0, "client side closed early");
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(b"250 queued\r\n").await.unwrap();
            let _ = socket.read_to_end(&mut received).await;
            received
        });

        let h = harness(&upstream_addr, 2).await;
        let (proxy_addr, proxy) = spawn_proxy(h.ctx.clone()).await;

        let mut client = TcpStream::connect(&proxy_addr).await.unwrap();
        client
            .write_all(b"XFORWARD NAME=mx.example.com ADDR=192.0.2.1\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.write_all(b"DATA\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        client
            .write_all(
                b"Received: from mx.example.com\r\n\
                  Received-SPF: pass\r\n\
                  Message-ID: <ham-1@example.com>\r\n\
                  Subject: hello\r\n\
                  \r\n\
                  Received-SPF: quoted in the body\r\n.\r\n",
            )
            .await
            .unwrap();

        let mut reply = [0u8; 12];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"250 queued\r\n");
        client.shutdown().await.unwrap();
        proxy.await.unwrap();

        let decoded = audit_files(&h.audit_dir, "sdec_");
        assert_eq!(decoded.len(), 1);
        let id = decoded[0]
            .strip_prefix("sdec_")
            .and_then(|name| name.strip_suffix(".txt"))
            .unwrap()
            .to_string();

        let received = String::from_utf8(upstream_task.await.unwrap()).unwrap();
        let expected = format!(
            "X-Forward: NAME=mx.example.com ADDR=192.0.2.1 file={}\r\nReceived-SPF: pass\r\n",
            id
        );
        assert_eq!(received.matches(&expected).count(), 1);
        assert_eq!(received.matches("X-Forward:").count(), 1);

        let sdec = std::fs::read_to_string(h.audit_dir.join(&decoded[0])).unwrap();
        assert!(!sdec.contains("X-Forward"));
        assert!(sdec.contains("Received-SPF: pass"));
    }
}
