pub mod signal;

use std::fmt;

use anyhow::Result;
use chrono::Local;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

// 带颜色的控制台输出层
struct ConsoleLayer;

impl<S> Layer<S> for ConsoleLayer
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let level = event.metadata().level();

        let mut visitor = MessageVisitor::new();
        event.record(&mut visitor);

        if let Some(message) = visitor.message {
            let timestamp = Local::now().format("%b %d %H:%M:%S");
            let (color_code, level_str) = match *level {
                tracing::Level::ERROR => ("\x1b[31m", "ERROR"),
                tracing::Level::WARN => ("\x1b[33m", " WARN"),
                tracing::Level::INFO => ("\x1b[32m", " INFO"),
                tracing::Level::DEBUG => ("\x1b[36m", "DEBUG"),
                tracing::Level::TRACE => ("\x1b[35m", "TRACE"),
            };
            let fields = if visitor.fields.is_empty() {
                String::new()
            } else {
                format!(" \x1b[2m{}\x1b[0m", visitor.fields.join(" "))
            };
            println!(
                "\x1b[2m{}\x1b[0m {}{:>5}\x1b[0m {}{}",
                timestamp, color_code, level_str, message, fields
            );
        }
    }
}

// 提取日志消息和附带字段
struct MessageVisitor {
    message: Option<String>,
    fields: Vec<String>,
}

impl MessageVisitor {
    fn new() -> Self {
        Self {
            message: None,
            fields: Vec::new(),
        }
    }
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{:?}", value));
        } else {
            self.fields.push(format!("{}={:?}", field.name(), value));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push(format!("{}={}", field.name(), value));
        }
    }
}

pub fn init_logger(log_level: &str) -> Result<()> {
    let console_layer = ConsoleLayer.with_filter(build_console_filter(log_level));
    tracing_subscriber::registry().with(console_layer).try_init()?;
    Ok(())
}

/// 构建日志过滤器，压低数据库和 HTTP 客户端的噪音
fn build_console_filter(base_level: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder().parse_lossy(format!(
        "{},\
            sqlx::query=error,\
            sqlx=error,\
            sea_orm::database=error,\
            sea_orm_migration=warn,\
            tokio_util=warn,\
            hyper=warn,\
            reqwest=warn,\
            h2=warn,\
            html5ever=error,\
            selectors=error",
        base_level
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_filter_keeps_base_level() {
        let filter = build_console_filter("debug").to_string();
        assert!(filter.contains("debug"));
        assert!(filter.contains("sqlx=error"));
        assert!(filter.contains("reqwest=warn"));
    }
}
