use std::fmt::Write;

use snapshot::ChangeEvent;

const MAX_EVENT_LINES: usize = 20;

/// Everything worth telling about one target after a cycle.
#[derive(Debug, Clone)]
pub struct ChangeReport {
    pub target: String,
    pub url: String,
    pub item_count: usize,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Clone)]
pub enum Message {
    Started { urls: Vec<String> },
    Changes(ChangeReport),
    /// Needs operator attention: block pages, layout drift, storage trouble.
    Alert {
        target: String,
        url: String,
        reason: String,
    },
}

impl Message {
    pub fn render(&self) -> String {
        match self {
            Message::Started { urls } => {
                let mut text = String::from("Watcher started.");
                for url in urls {
                    let _ = write!(text, "\n{url}");
                }
                text
            }
            Message::Changes(report) => render_report(report),
            Message::Alert {
                target,
                url,
                reason,
            } => format!("⚠️ Watcher problem on {target}\nURL: {url}\n{reason}"),
        }
    }
}

fn render_report(report: &ChangeReport) -> String {
    let mut text = format!(
        "🚨 Change detected on {}\nURL: {}\nItems now: {}\n",
        report.target, report.url, report.item_count
    );
    for event in report.events.iter().take(MAX_EVENT_LINES) {
        let _ = write!(text, "\n{}", event_line(event));
    }
    if report.events.len() > MAX_EVENT_LINES {
        let _ = write!(text, "\n… and {} more", report.events.len() - MAX_EVENT_LINES);
    }
    text
}

fn event_line(event: &ChangeEvent) -> String {
    match event {
        ChangeEvent::Added { item } => {
            let price = item
                .price
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "price unknown".into());
            match &item.url {
                Some(url) => format!("+ {} ({price}) {url}", item.title),
                None => format!("+ {} ({price})", item.title),
            }
        }
        ChangeEvent::Removed { item } => format!("- {}", item.title),
        ChangeEvent::PriceChanged { id, old, new } => format!(
            "~ {id}: price {} → {}",
            display_or_unknown(old.as_ref()),
            display_or_unknown(new.as_ref())
        ),
        ChangeEvent::AvailabilityChanged { id, old, new } => {
            format!("~ {id}: {old} → {new}")
        }
    }
}

fn display_or_unknown<T: ToString>(value: Option<&T>) -> String {
    value
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".into())
}
