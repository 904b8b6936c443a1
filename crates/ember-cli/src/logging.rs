use std::{fs::OpenOptions, sync::Arc};

use nu_ansi_term::Color::{Blue, Magenta, Red, Yellow};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    fmt::{
        self,
        format::{FmtSpan, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    registry::LookupSpan,
};

use crate::args::Args;
use ember_events::Display;

#[derive(Default)]
struct MessageVisitor {
    message: Option<String>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        }
    }
}

pub struct CustomFormatter;

impl<S, N> FormatEvent<S, N> for CustomFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        match *event.metadata().level() {
            Level::TRACE => write!(writer, "{} ", Magenta.paint("[TRACE]")),
            Level::DEBUG => write!(writer, "{} ", Blue.paint("[DEBUG]")),
            Level::INFO => write!(writer, ""),
            Level::WARN => write!(writer, "{} ", Yellow.paint("[WARN]")),
            Level::ERROR => write!(writer, "{} ", Red.paint("[ERROR]")),
        }?;

        if let Some(message) = visitor.message {
            writeln!(writer, "{message}")
        } else {
            writeln!(writer)
        }
    }
}

struct WriterBuilder {
    stdout: std::io::Stdout,
    stderr: std::io::Stderr,
}

impl WriterBuilder {
    fn new() -> Self {
        Self {
            stdout: std::io::stdout(),
            stderr: std::io::stderr(),
        }
    }
}

impl<'a> MakeWriter<'a> for WriterBuilder {
    type Writer = Box<dyn std::io::Write + 'a>;

    fn make_writer(&'a self) -> Self::Writer {
        Box::new(self.stdout.lock())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        if meta.level() == &tracing::Level::INFO {
            Box::new(self.stdout.lock())
        } else {
            Box::new(self.stderr.lock())
        }
    }
}

pub fn setup_logging(args: &Args) {
    let filter_level = match args.display {
        Display::None => Level::WARN,
        Display::Passive => Level::INFO,
        Display::Full => Level::INFO,
    };
    let env_filter = std::env::var("EMBER_LOG")
        .unwrap_or_else(|_| format!("ember={filter_level}"));

    if let Some(log_path) = &args.log_path {
        let file = OpenOptions::new()
            .create(true)
            .append(args.log_append)
            .truncate(!args.log_append)
            .write(true)
            .open(log_path);
        if let Ok(file) = file {
            let subscriber = fmt::Subscriber::builder()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_ansi(false)
                .with_span_events(FmtSpan::NONE)
                .with_writer(Arc::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .expect("Failed to set tracing subscriber");
            return;
        }
        eprintln!("warning: cannot open log file '{log_path}', logging to console");
    }

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_span_events(FmtSpan::NONE)
        .with_writer(WriterBuilder::new())
        .compact()
        .without_time()
        .event_format(CustomFormatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}
