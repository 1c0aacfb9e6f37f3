use std::fmt;

use chrono::{SecondsFormat, Utc};
use tracing::{field, Event, Subscriber};
use tracing_subscriber::{
    field::VisitOutput,
    fmt::{format::Writer, FmtContext, FormatEvent, FormatFields, Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

const APP_NAME: &str = "MONAGENT";

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new().event_format(PipeFormatter).with_writer(writer).boxed()
    }
}

/// Formats events as `<time> | MONAGENT | <LEVEL> | (<file>:<line>) | key:value,... | <message>`.
struct PipeFormatter;

impl<S, N> FormatEvent<S, N> for PipeFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(&self, _ctx: &FmtContext<'_, S, N>, mut writer: Writer<'_>, event: &Event<'_>) -> fmt::Result {
        let metadata = event.metadata();

        write!(
            writer,
            "{} | {} | {} | ({}:{})",
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            APP_NAME,
            metadata.level(),
            metadata.file().unwrap_or("unknown"),
            metadata.line().unwrap_or(0),
        )?;

        let mut visitor = PipeFieldVisitor::new(writer.by_ref());
        event.record(&mut visitor);
        visitor.finish()?;

        writeln!(writer)
    }
}

/// Writes structured fields as comma-separated `key:value` pairs, holding the message back so it is always last.
struct PipeFieldVisitor<'writer> {
    writer: Writer<'writer>,
    fields_written: usize,
    message: String,
    result: fmt::Result,
}

impl<'writer> PipeFieldVisitor<'writer> {
    fn new(writer: Writer<'writer>) -> Self {
        Self {
            writer,
            fields_written: 0,
            message: String::new(),
            result: Ok(()),
        }
    }

    fn write_field(&mut self, field: &field::Field, value: fmt::Arguments<'_>) {
        if self.result.is_err() {
            return;
        }

        if field.name() == "message" {
            self.result = fmt::write(&mut self.message, value);
            return;
        }

        let separator = if self.fields_written == 0 { " | " } else { "," };
        self.result = write!(self.writer, "{}{}:{}", separator, field.name(), value);
        if self.result.is_ok() {
            self.fields_written += 1;
        }
    }
}

impl field::Visit for PipeFieldVisitor<'_> {
    fn record_debug(&mut self, field: &field::Field, value: &dyn fmt::Debug) {
        self.write_field(field, format_args!("{:?}", value));
    }

    fn record_str(&mut self, field: &field::Field, value: &str) {
        self.write_field(field, format_args!("{}", value));
    }

    fn record_f64(&mut self, field: &field::Field, value: f64) {
        self.write_field(field, format_args!("{}", value));
    }

    fn record_i64(&mut self, field: &field::Field, value: i64) {
        self.write_field(field, format_args!("{}", value));
    }

    fn record_u64(&mut self, field: &field::Field, value: u64) {
        self.write_field(field, format_args!("{}", value));
    }

    fn record_bool(&mut self, field: &field::Field, value: bool) {
        self.write_field(field, format_args!("{}", value));
    }
}

impl VisitOutput<fmt::Result> for PipeFieldVisitor<'_> {
    fn finish(mut self) -> fmt::Result {
        self.result?;

        if self.message.is_empty() {
            Ok(())
        } else {
            write!(self.writer, " | {}", self.message)
        }
    }
}
