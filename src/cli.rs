use clap::ValueEnum;

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Default directive for the `clipfetch` targets; `RUST_LOG` still wins.
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Error => "clipfetch=error",
            LogLevel::Warn => "clipfetch=warn",
            LogLevel::Info => "clipfetch=info",
            LogLevel::Debug => "clipfetch=debug",
            LogLevel::Trace => "clipfetch=trace",
        }
    }
}
