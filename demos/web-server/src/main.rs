//! Dispatch workspace server.
//!
//! Run with: cargo run -p dispatch-web-server
//!
//! Then open http://localhost:3000/?key=<DISPATCH_KEY> in your browser.
//! Sessions survive the page being closed; reloading re-attaches and
//! catches up from the last acknowledged sequence number.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{Router, response::Html, routing::get};
use dispatch_adapters::{AgentAdapter, EditorAdapter, RunnerAdapter, TerminalAdapter};
use dispatch_core::collaborators::{MemorySettings, RootedResolver, StaticKeyValidator};
use dispatch_core::store::EventStore;
use dispatch_session::manager::{AdapterRegistry, RunSessionManager};
use dispatch_session::storage::MemoryRepository;
use dispatch_session::ClaudeAuthManager;
use dispatch_transport::{RouterState, create_router};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let key = std::env::var("DISPATCH_KEY").unwrap_or_else(|_| "dev".into());
    let workspace_root =
        std::env::current_dir().context("cannot determine working directory")?;

    let registry = AdapterRegistry::new()
        .with(Arc::new(TerminalAdapter::new()))
        .with(Arc::new(AgentAdapter::new("claude")))
        .with(Arc::new(RunnerAdapter::new("opencode")))
        .with(Arc::new(EditorAdapter::new()));

    let manager = Arc::new(RunSessionManager::new(
        Arc::new(MemoryRepository::new()),
        Arc::new(EventStore::new()),
        registry,
        Arc::new(MemorySettings::new()),
        Arc::new(RootedResolver::new(workspace_root.clone())),
    ));
    let auth = Arc::new(ClaudeAuthManager::new(Arc::clone(&manager)));

    let state = RouterState {
        manager,
        auth,
        validator: Arc::new(StaticKeyValidator::new(key)),
    };

    let app = Router::new()
        .route("/", get(index_handler))
        .merge(create_router(state));

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!(%addr, root = %workspace_root.display(), "dispatch listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind")?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Dispatch</title>
    <link rel="stylesheet" href="https://cdn.jsdelivr.net/npm/xterm@5.3.0/css/xterm.css" />
    <script src="https://cdn.jsdelivr.net/npm/xterm@5.3.0/lib/xterm.js"></script>
    <script src="https://cdn.jsdelivr.net/npm/xterm-addon-fit@0.8.0/lib/xterm-addon-fit.js"></script>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        #terminal-container {
            width: 100%;
            height: calc(100vh - 100px);
        }
        .status {
            color: #888;
            font-size: 14px;
            margin-bottom: 10px;
        }
        .connected { color: #4a4; }
        .disconnected { color: #a44; }
        .catching-up { color: #aa4; }
    </style>
</head>
<body>
    <h1>Dispatch</h1>
    <div class="status" id="status">Connecting...</div>
    <div id="terminal-container"></div>

    <script>
        const term = new Terminal({
            cursorBlink: true,
            fontSize: 14,
            fontFamily: 'Menlo, Monaco, "Courier New", monospace',
            theme: {
                background: '#1e1e1e',
                foreground: '#d4d4d4',
            }
        });

        const fitAddon = new FitAddon.FitAddon();
        term.loadAddon(fitAddon);
        term.open(document.getElementById('terminal-container'));
        fitAddon.fit();

        const status = document.getElementById('status');
        const key = new URLSearchParams(window.location.search).get('key') || 'dev';

        // Reattach state: survives reconnects within this page.
        let sessionId = null;
        let lastSeq = 0;
        let nextRequestId = 1;
        let ws;

        function send(msg) {
            if (ws && ws.readyState === WebSocket.OPEN) {
                ws.send(JSON.stringify(msg));
            }
        }

        function connect() {
            const protocol = window.location.protocol === 'https:' ? 'wss:' : 'ws:';
            ws = new WebSocket(`${protocol}//${window.location.host}/ws`);

            ws.onopen = () => {
                status.textContent = 'Authenticating...';
                send({ type: 'auth', id: nextRequestId++, key });
                if (sessionId === null) {
                    send({
                        type: 'session_create',
                        id: nextRequestId++,
                        kind: 'terminal',
                        workspace_path: '.',
                        cols: term.cols,
                        rows: term.rows,
                    });
                } else {
                    status.textContent = 'Catching up...';
                    status.className = 'status catching-up';
                    send({
                        type: 'session_attach',
                        id: nextRequestId++,
                        session_id: sessionId,
                        from_seq: lastSeq,
                    });
                }
            };

            ws.onclose = () => {
                status.textContent = 'Disconnected - reconnecting...';
                status.className = 'status disconnected';
                setTimeout(connect, 2000);
            };

            ws.onerror = (err) => {
                console.error('WebSocket error:', err);
            };

            ws.onmessage = (event) => {
                try {
                    const msg = JSON.parse(event.data);
                    handleMessage(msg);
                } catch (e) {
                    console.error('Failed to parse message:', e);
                }
            };
        }

        function handleMessage(msg) {
            if (msg.type === 'session_created') {
                sessionId = msg.session_id;
                send({
                    type: 'session_attach',
                    id: nextRequestId++,
                    session_id: sessionId,
                    from_seq: 0,
                });
            } else if (msg.type === 'event') {
                const ev = msg.event;
                lastSeq = Math.max(lastSeq, ev.seq);
                if (ev.channel === 'session:output' && ev.payload.data) {
                    term.write(atob(ev.payload.data));
                } else if (ev.channel === 'session:status') {
                    if (ev.payload.status === 'stopped' || ev.payload.status === 'error') {
                        term.writeln(`\r\n[session ${ev.payload.status}]\r\n`);
                    }
                } else if (ev.channel === 'auth:url') {
                    term.writeln(`\r\n[authorize at: ${ev.payload.url}]\r\n`);
                }
            } else if (msg.type === 'caught_up') {
                status.textContent = 'Connected';
                status.className = 'status connected';
            } else if (msg.type === 'error') {
                term.writeln(`\r\n[${msg.error}: ${msg.message}]\r\n`);
            }
        }

        // Handle terminal input
        term.onData((data) => {
            if (sessionId !== null) {
                send({ type: 'session_input', session_id: sessionId, data: btoa(data) });
            }
        });

        // Handle resize
        window.addEventListener('resize', () => {
            fitAddon.fit();
            if (sessionId !== null) {
                send({
                    type: 'session_resize',
                    session_id: sessionId,
                    cols: term.cols,
                    rows: term.rows,
                });
            }
        });

        // Start connection
        connect();
    </script>
</body>
</html>
"#;
