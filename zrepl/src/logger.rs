use env_logger::{Builder, Env};
use std::io::Write;
use std::path::Path;

/// Configure the logging format and level. `RUST_LOG=zrepl=trace` and
/// friends override the level passed here.
pub fn init(level: &str) {
    builder(level).init();
}

/// Like [`init`] but tolerant of an already installed logger; used by the
/// test binaries where any test may get there first.
pub fn try_init(level: &str) {
    let _ = builder(level).try_init();
}

fn builder(level: &str) -> Builder {
    let mut builder =
        Builder::from_env(Env::default().default_filter_or(level.to_string()));

    builder.format(|buf, record| {
        let mut level_style = buf.default_level_style(record.level());
        level_style.set_intense(true);
        writeln!(
            buf,
            "[{} {} {}:{}] {}",
            buf.timestamp_nanos(),
            level_style.value(record.level()),
            record
                .file()
                .map(|f| {
                    Path::new(f)
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_else(|| f.to_string())
                })
                .unwrap_or_default(),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    builder
}
