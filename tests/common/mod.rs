#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use reportq::broker::{Connection, ConnectionOptions, MemoryBroker};
use reportq::errors::{BrokerFault, LogError};
use reportq::jobs::report::{ReportSource, ResultRow};
use reportq::joblog::{JobLog, JobQueueLog};
use reportq::sink::ErrorSink;
use reportq::JobStatus;

/// One log row as seen by the store: every status it was written with, and
/// its last written state.
#[derive(Debug, Clone)]
pub struct RecordedRow {
    pub history: Vec<JobStatus>,
    pub last: JobQueueLog,
}

/// In-memory job log that keeps the full status history of every row.
#[derive(Debug, Default)]
pub struct RecordingLog {
    next_id: AtomicI64,
    rows: Mutex<BTreeMap<i64, RecordedRow>>,
    pub fail_writes: bool,
}

impl RecordingLog {
    pub fn failing() -> Self {
        RecordingLog {
            fail_writes: true,
            ..Default::default()
        }
    }

    pub fn rows(&self) -> BTreeMap<i64, RecordedRow> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobLog for RecordingLog {
    async fn create(&self, entry: &JobQueueLog) -> Result<i64, LogError> {
        if self.fail_writes {
            return Err(LogError::Store(sqlx::Error::PoolTimedOut));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut last = entry.clone();
        last.id = Some(id);
        let previous = self.rows.lock().unwrap().insert(
            id,
            RecordedRow {
                history: vec![entry.process_status],
                last,
            },
        );
        assert!(previous.is_none(), "row id {id} handed out twice");
        Ok(id)
    }

    async fn update(&self, entry: &JobQueueLog) -> Result<(), LogError> {
        if self.fail_writes {
            return Err(LogError::Store(sqlx::Error::PoolTimedOut));
        }
        let id = entry.id.ok_or(LogError::MissingId)?;
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(LogError::NotUpdated(id))?;
        row.history.push(entry.process_status);
        row.last = entry.clone();
        Ok(())
    }
}

/// Report source returning fixed rows, or a query error.
#[derive(Debug, Default)]
pub struct StaticSource {
    pub rows: Vec<ResultRow>,
    pub fail: bool,
    pub requested: Mutex<Vec<Option<i64>>>,
}

impl StaticSource {
    pub fn with_rows(rows: Vec<ResultRow>) -> Self {
        StaticSource {
            rows,
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        StaticSource {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ReportSource for StaticSource {
    async fn small_talks(&self, student_id: Option<i64>) -> Result<Vec<ResultRow>, sqlx::Error> {
        self.requested.lock().unwrap().push(student_id);
        if self.fail {
            return Err(sqlx::Error::Protocol("relation \"small_talks\" does not exist".into()));
        }
        Ok(self.rows.clone())
    }
}

pub fn small_talk(subject: &str, student: &str) -> ResultRow {
    ResultRow {
        created_at: Utc.with_ymd_and_hms(2024, 5, 2, 9, 15, 0).unwrap(),
        subject: subject.into(),
        detail: "school | service | target | action".into(),
        status: "OPEN".into(),
        student_name: Some(student.into()),
    }
}

pub async fn open(broker: &Arc<MemoryBroker>) -> (Connection, UnboundedReceiver<BrokerFault>) {
    open_with(broker, ConnectionOptions::default()).await
}

pub async fn open_with(
    broker: &Arc<MemoryBroker>,
    options: ConnectionOptions,
) -> (Connection, UnboundedReceiver<BrokerFault>) {
    let (sink, faults) = ErrorSink::channel();
    let connection = Connection::open_with("test consumer", broker.clone(), sink, options)
        .await
        .unwrap();
    (connection, faults)
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Unpacked text parts of a written xlsx file.
#[derive(Debug)]
pub struct Workbook {
    pub workbook: String,
    pub sheet: String,
    pub styles: String,
    pub shared_strings: String,
}

impl Workbook {
    pub fn open(path: &Path) -> Self {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let mut part = |name: &str| {
            let mut text = String::new();
            archive.by_name(name).unwrap().read_to_string(&mut text).unwrap();
            text
        };
        Workbook {
            workbook: part("xl/workbook.xml"),
            sheet: part("xl/worksheets/sheet1.xml"),
            styles: part("xl/styles.xml"),
            shared_strings: part("xl/sharedStrings.xml"),
        }
    }

    pub fn sheet_names(&self) -> Vec<&str> {
        self.workbook
            .match_indices("<sheet name=\"")
            .map(|(at, tag)| {
                let rest = &self.workbook[at + tag.len()..];
                &rest[..rest.find('"').unwrap()]
            })
            .collect()
    }

    pub fn row_count(&self) -> usize {
        self.sheet.matches("<row ").count()
    }

    /// The `<c ...>...</c>` element of one cell, e.g. `cell("A2")`.
    pub fn cell(&self, reference: &str) -> &str {
        let start = self
            .sheet
            .find(&format!("<c r=\"{reference}\""))
            .unwrap_or_else(|| panic!("cell {reference} missing"));
        let len = self.sheet[start..].find("</c>").unwrap() + "</c>".len();
        &self.sheet[start..start + len]
    }

    pub fn has_string(&self, text: &str) -> bool {
        self.shared_strings.contains(&format!("<t>{text}</t>"))
    }
}
