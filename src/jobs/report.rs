//! Small talk report job: payload -> query -> spreadsheet -> file -> log.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use rust_xlsxwriter::{Format, Workbook};
use serde::Deserialize;
use tracing::*;

use super::settle;
use crate::broker::{Consumer, Delivery};
use crate::config::ReportSettings;
use crate::errors::ReportError;
use crate::joblog::{
    JobLog, JobQueueLog, Lifecycle, PROCESS_RESULT_FILE, PROCESS_TYPE_REPORT,
};

const DATE_FORMAT: &str = "yyyy-mm-dd hh:mm:ss";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReportPayload {
    pub user_id: i64,
    #[serde(default)]
    pub student_id: Option<i64>,
}

impl ReportPayload {
    pub fn parse(payload: &str) -> Result<Self, ReportError> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// One small talk record as queried for the report.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ResultRow {
    pub created_at: DateTime<Utc>,
    pub subject: String,
    pub detail: String,
    pub status: String,
    pub student_name: Option<String>,
}

#[async_trait]
pub trait ReportSource: Send + Sync {
    /// Non-deleted small talks, narrowed to one student when given.
    async fn small_talks(&self, student_id: Option<i64>) -> Result<Vec<ResultRow>, sqlx::Error>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Header(String),
    Index(u32),
    Text(String),
    DateTime(NaiveDateTime),
}

/// Lays out the sheet: the header row, then one row per record numbered
/// from 1 in query order.
pub fn layout(headers: &[String], rows: &[ResultRow]) -> Vec<Vec<Cell>> {
    let mut sheet = Vec::with_capacity(rows.len() + 1);
    sheet.push(headers.iter().cloned().map(Cell::Header).collect());
    for (index, row) in rows.iter().enumerate() {
        sheet.push(vec![
            Cell::Index(index as u32 + 1),
            Cell::Text(row.student_name.clone().unwrap_or_default()),
            Cell::DateTime(row.created_at.naive_utc()),
            Cell::Text(row.subject.clone()),
            Cell::Text(row.detail.clone()),
            Cell::Text(row.status.clone()),
        ]);
    }
    sheet
}

/// Renders the workbook into xlsx bytes. The workbook lives only inside this
/// call, so it is released on every path.
pub fn render(settings: &ReportSettings, rows: &[ResultRow]) -> Result<Vec<u8>, ReportError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let date_format = Format::new().set_num_format(DATE_FORMAT);

    let worksheet = workbook.add_worksheet();
    worksheet.set_name(&settings.sheet_name)?;

    for (r, cells) in layout(&settings.headers, rows).iter().enumerate() {
        let row = r as u32;
        for (c, cell) in cells.iter().enumerate() {
            let col = c as u16;
            match cell {
                Cell::Header(text) => {
                    worksheet.write_string_with_format(row, col, text, &header_format)?;
                }
                Cell::Index(n) => {
                    worksheet.write_number(row, col, *n)?;
                }
                Cell::Text(text) => {
                    worksheet.write_string(row, col, text)?;
                }
                Cell::DateTime(datetime) => {
                    worksheet.write_datetime_with_format(row, col, datetime, &date_format)?;
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}

/// Runs [`render`] on the blocking pool so large workbooks do not stall the
/// runtime workers.
pub async fn render_blocking(
    settings: Arc<ReportSettings>,
    rows: Vec<ResultRow>,
) -> Result<Vec<u8>, ReportError> {
    tokio::task::spawn_blocking(move || render(&settings, &rows)).await?
}

/// `<prefix><random non-negative integer>.xlsx`
pub fn generate_file_name(prefix: &str) -> String {
    let n: i64 = rand::thread_rng().gen_range(0..i64::MAX);
    format!("{prefix}{n}.xlsx")
}

async fn persist(dir: &Path, file_name: &str, bytes: &[u8]) -> Result<(), ReportError> {
    let path = dir.join(file_name);
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|source| ReportError::Persist {
            path: dir.to_path_buf(),
            source,
        })?;
    tokio::fs::write(&path, bytes)
        .await
        .map_err(|source| ReportError::Persist { path, source })
}

pub struct ReportSmallTalk {
    worker_index: usize,
    log: Arc<dyn JobLog>,
    source: Arc<dyn ReportSource>,
    settings: Arc<ReportSettings>,
}

impl ReportSmallTalk {
    pub fn new(
        worker_index: usize,
        log: Arc<dyn JobLog>,
        source: Arc<dyn ReportSource>,
        settings: Arc<ReportSettings>,
    ) -> Self {
        ReportSmallTalk {
            worker_index,
            log,
            source,
            settings,
        }
    }

    /// Query, render and persist. Returns the generated file name.
    async fn generate(&self, payload: &ReportPayload) -> Result<String, ReportError> {
        let rows = self
            .source
            .small_talks(payload.student_id)
            .await
            .map_err(ReportError::Query)?;
        debug!(rows = rows.len(), "Fetched report rows");

        let bytes = render_blocking(self.settings.clone(), rows).await?;
        let file_name = generate_file_name(&self.settings.file_name_prefix);
        persist(&self.settings.output_location, &file_name, &bytes).await?;
        Ok(file_name)
    }
}

#[async_trait]
impl Consumer for ReportSmallTalk {
    async fn consume(&self, delivery: Delivery) {
        info!(worker = self.worker_index, "Executing report job");

        let payload = match ReportPayload::parse(delivery.payload()) {
            Ok(payload) => payload,
            Err(err) => {
                error!(message = "Rejecting unparsable payload", payload = delivery.payload(), error = %err);
                settle(delivery.reject()).await;
                return;
            }
        };

        let entry = JobQueueLog::new(
            self.settings.process_name.as_str(),
            PROCESS_TYPE_REPORT,
            PROCESS_RESULT_FILE,
            delivery.payload(),
            payload.user_id,
        );
        let mut lifecycle = Lifecycle::register(self.log.clone(), entry).await;
        lifecycle.processing().await;

        match self.generate(&payload).await {
            Ok(file_name) => {
                info!(
                    message = "Report generated",
                    job_id = ?lifecycle.entry().id,
                    path = %self.settings.output_location.join(&file_name).display()
                );
                lifecycle.succeeded(file_name).await;
                settle(delivery.ack()).await;
            }
            Err(err) => {
                error!(message = "Report failed", job_id = ?lifecycle.entry().id, error = %err);
                lifecycle.failed(err.to_string()).await;
                settle(delivery.reject()).await;
            }
        }
    }
}
