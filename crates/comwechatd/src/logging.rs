/// Logging goes to stderr; stdout carries the JSONL protocol.
///
/// `RUST_LOG` overrides the default filter.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comwechat_core=debug,comwechatd=debug,info".into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
