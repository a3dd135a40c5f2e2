//! Script runner web server.
//!
//! Run with: cargo run -p scriptdeck-server
//!
//! Then open http://localhost:8001 in your browser.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use axum::{response::Html, routing::get};
use scriptdeck_core::{EngineConfig, HistoryStore, ScriptStore};
use scriptdeck_executor::ShellRunner;
use scriptdeck_session::{RunCoordinator, storage::MemoryStorage};
use scriptdeck_transport::router;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_CONFIG: &str = "SCRIPTDECK_CONFIG";
const ENV_ADDR: &str = "SCRIPTDECK_ADDR";
#[cfg(feature = "sqlite")]
const ENV_DATABASE_URL: &str = "SCRIPTDECK_DATABASE_URL";

const DEFAULT_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 8001);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = load_config()?;
    let addr = match std::env::var(ENV_ADDR) {
        Ok(addr) => addr
            .parse()
            .with_context(|| format!("{ENV_ADDR} is not a socket address: {addr}"))?,
        Err(_) => SocketAddr::from(DEFAULT_ADDR),
    };

    #[cfg(feature = "sqlite")]
    {
        if let Ok(url) = std::env::var(ENV_DATABASE_URL) {
            let storage = scriptdeck_session::storage::SqliteStorage::new(&url)
                .await
                .with_context(|| format!("Failed to open database {url}"))?
                .with_history_limit(config.history_limit);
            tracing::info!(%url, "Using SQLite storage");
            return serve(storage, config, addr).await;
        }
    }

    let storage = MemoryStorage::with_history_limit(config.history_limit);
    serve(storage, config, addr).await
}

fn load_config() -> anyhow::Result<EngineConfig> {
    let config = match std::env::var_os(ENV_CONFIG) {
        Some(path) => EngineConfig::load(&PathBuf::from(path))?,
        None => EngineConfig::default(),
    };
    let config = config.apply_env()?;
    tracing::info!(
        working_dir = %config.default_working_dir.display(),
        grace_ms = config.terminate_grace_ms,
        history_policy = ?config.history_policy,
        "Loaded configuration"
    );
    Ok(config)
}

async fn serve<S>(storage: S, config: EngineConfig, addr: SocketAddr) -> anyhow::Result<()>
where
    S: ScriptStore + HistoryStore + 'static,
{
    let coordinator = RunCoordinator::new(storage, ShellRunner::new(), config);

    let app = router(coordinator.clone())
        .route("/", get(index_handler))
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {e}");
                return;
            }
            tracing::info!("Shutting down");
            coordinator.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

const INDEX_HTML: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>scriptdeck</title>
    <style>
        body {
            margin: 0;
            padding: 20px;
            background: #1e1e1e;
            color: #d4d4d4;
            font-family: system-ui, sans-serif;
        }
        h1 { color: #fff; margin-bottom: 10px; }
        input, select, button { font-size: 14px; margin-right: 6px; }
        pre {
            background: #111;
            padding: 10px;
            height: calc(100vh - 160px);
            overflow: auto;
            font-family: Menlo, Monaco, "Courier New", monospace;
        }
        .error { color: #e66; }
        .status { color: #888; font-size: 14px; margin: 10px 0; }
    </style>
</head>
<body>
    <h1>scriptdeck</h1>
    <div>
        <select id="script"></select>
        <input id="args" placeholder="arguments" />
        <input id="cwd" placeholder="working directory" />
        <button id="run">Run</button>
        <button id="cancel" disabled>Cancel</button>
    </div>
    <div class="status" id="status">Idle</div>
    <pre id="output"></pre>

    <script>
        const output = document.getElementById('output');
        const status = document.getElementById('status');
        const runButton = document.getElementById('run');
        const cancelButton = document.getElementById('cancel');
        let sessionId = null;

        function unescape(data) {
            return data.replace(/\\(.)/g, (_, c) => c === 'n' ? '\n' : c === 'r' ? '\r' : c === '\\' ? '\\' : '\\' + c);
        }

        function append(text, cls) {
            const span = document.createElement('span');
            if (cls) span.className = cls;
            span.textContent = text;
            output.appendChild(span);
            output.scrollTop = output.scrollHeight;
        }

        async function loadScripts() {
            const res = await fetch('/api/scripts');
            const { scripts } = await res.json();
            const select = document.getElementById('script');
            select.innerHTML = '';
            for (const s of scripts) {
                const opt = document.createElement('option');
                opt.value = s.name;
                opt.textContent = `${s.category} / ${s.name}`;
                select.appendChild(opt);
            }
        }

        function handleFrame(kind, data) {
            if (kind === 'output') append(data);
            else if (kind === 'error') append(data, 'error');
            else {
                status.textContent = data;
                runButton.disabled = false;
                cancelButton.disabled = true;
                sessionId = null;
            }
        }

        runButton.onclick = async () => {
            output.textContent = '';
            runButton.disabled = true;
            status.textContent = 'Running';
            const body = {
                script_name: document.getElementById('script').value,
                arguments: document.getElementById('args').value,
            };
            const cwd = document.getElementById('cwd').value;
            if (cwd) body.working_directory = cwd;

            const res = await fetch('/api/scripts/run', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify(body),
            });
            sessionId = res.headers.get('x-session-id');
            cancelButton.disabled = !sessionId;

            const reader = res.body.pipeThrough(new TextDecoderStream()).getReader();
            let buffer = '';
            for (;;) {
                const { value, done } = await reader.read();
                if (done) break;
                buffer += value;
                let end;
                while ((end = buffer.indexOf('\n\n')) >= 0) {
                    const block = buffer.slice(0, end);
                    buffer = buffer.slice(end + 2);
                    let kind = null, data = [];
                    for (const line of block.split('\n')) {
                        if (line.startsWith('event:')) kind = line.slice(6).trim();
                        else if (line.startsWith('data:')) data.push(line.slice(5).replace(/^ /, ''));
                    }
                    if (kind) handleFrame(kind, unescape(data.join('\n')));
                }
            }
        };

        cancelButton.onclick = async () => {
            if (!sessionId) return;
            await fetch('/api/scripts/cancel', {
                method: 'POST',
                headers: { 'Content-Type': 'application/json' },
                body: JSON.stringify({ session_id: sessionId }),
            });
        };

        loadScripts();
    </script>
</body>
</html>
"#;
