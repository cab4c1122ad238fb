use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::errors::{ErrorKind, JobError};
use crate::executor::QueryStream;
use crate::models::{CellValue, ExportFormat};

/// Result of a finished export, merged into the job's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub row_count: u64,
    pub column_count: u64,
    pub byte_size: u64,
}

/// Deterministic spool location for a job's export file.
pub fn spool_path(spool_root: &Path, user_id: i64, job_id: i64, format: ExportFormat) -> PathBuf {
    spool_root
        .join(user_id.to_string())
        .join(format!("{job_id}.{}", format.extension()))
}

/// Remote filename used when the job does not name one.
pub fn default_remote_filename(job_id: i64, format: ExportFormat) -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    format!("query_{job_id}_{stamp}.{}", format.extension())
}

/// Drains the row stream into a finalized local file in the requested
/// format. Any failure exit removes the partial file so the spool does
/// not accumulate garbage; transfer failures later on deliberately do
/// not touch the finished file.
pub async fn export_rows(
    mut stream: QueryStream,
    format: ExportFormat,
    path: &Path,
    token: &CancellationToken,
) -> Result<ExportSummary, JobError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| io_error(format!("failed creating spool directory: {err}")))?;
    }

    let column_count = stream.columns.len() as u64;
    let result = match format {
        ExportFormat::Csv => write_csv(&mut stream, path, token).await,
        ExportFormat::Json => write_json(&mut stream, path, token).await,
        ExportFormat::Excel => write_excel(&mut stream, path, token).await,
        ExportFormat::Feather => write_feather(&mut stream, path, token).await,
    };

    match result {
        Ok(row_count) => {
            let byte_size = match std::fs::metadata(path) {
                Ok(meta) => meta.len(),
                Err(err) => {
                    return Err(io_error(format!("failed reading export size: {err}")));
                }
            };
            Ok(ExportSummary {
                row_count,
                column_count,
                byte_size,
            })
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(path).await;
            Err(err)
        }
    }
}

async fn write_csv(
    stream: &mut QueryStream,
    path: &Path,
    token: &CancellationToken,
) -> Result<u64, JobError> {
    let file =
        File::create(path).map_err(|err| io_error(format!("failed creating export: {err}")))?;
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(file);

    writer
        .write_record(&stream.columns)
        .map_err(|err| io_error(err.to_string()))?;

    let mut row_count = 0u64;
    while let Some(row) = next_row(stream, token).await? {
        writer
            .write_record(row.iter().map(CellValue::to_field))
            .map_err(|err| io_error(err.to_string()))?;
        row_count += 1;
    }

    writer.flush().map_err(|err| io_error(err.to_string()))?;
    Ok(row_count)
}

async fn write_json(
    stream: &mut QueryStream,
    path: &Path,
    token: &CancellationToken,
) -> Result<u64, JobError> {
    let file =
        File::create(path).map_err(|err| io_error(format!("failed creating export: {err}")))?;
    let mut writer = BufWriter::new(file);
    writer
        .write_all(b"[")
        .map_err(|err| io_error(err.to_string()))?;

    let mut row_count = 0u64;
    while let Some(row) = next_row(stream, token).await? {
        if row_count > 0 {
            writer
                .write_all(b",")
                .map_err(|err| io_error(err.to_string()))?;
        }
        let object: serde_json::Map<String, serde_json::Value> = stream
            .columns
            .iter()
            .zip(row.iter())
            .map(|(name, cell)| (name.clone(), cell.as_json()))
            .collect();
        serde_json::to_writer(&mut writer, &object)
            .map_err(|err| io_error(err.to_string()))?;
        row_count += 1;
    }

    writer
        .write_all(b"]")
        .map_err(|err| io_error(err.to_string()))?;
    writer.flush().map_err(|err| io_error(err.to_string()))?;
    Ok(row_count)
}

async fn write_excel(
    stream: &mut QueryStream,
    path: &Path,
    token: &CancellationToken,
) -> Result<u64, JobError> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let worksheet = workbook.add_worksheet();

    for (col, name) in stream.columns.iter().enumerate() {
        worksheet
            .write_string(0, col as u16, name)
            .map_err(|err| io_error(err.to_string()))?;
    }

    let mut row_count = 0u64;
    while let Some(row) = next_row(stream, token).await? {
        let sheet_row = (row_count + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            let col = col as u16;
            let written = match cell {
                CellValue::Null => Ok(&mut *worksheet),
                CellValue::Int(v) => worksheet.write_number(sheet_row, col, *v as f64),
                CellValue::Float(v) => worksheet.write_number(sheet_row, col, *v),
                CellValue::Bool(v) => worksheet.write_boolean(sheet_row, col, *v),
                CellValue::Text(v) => worksheet.write_string(sheet_row, col, v),
                CellValue::Bytes(_) => worksheet.write_string(sheet_row, col, cell.to_field()),
            };
            written.map_err(|err| io_error(err.to_string()))?;
        }
        row_count += 1;
    }

    workbook
        .save(path)
        .map_err(|err| io_error(err.to_string()))?;
    Ok(row_count)
}

async fn write_feather(
    stream: &mut QueryStream,
    path: &Path,
    token: &CancellationToken,
) -> Result<u64, JobError> {
    // The IPC snapshot needs whole columns, so rows are buffered and
    // column types inferred before anything is written.
    let mut rows: Vec<Vec<CellValue>> = Vec::new();
    while let Some(row) = next_row(stream, token).await? {
        rows.push(row);
    }

    let fields: Vec<Field> = stream
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| Field::new(name.as_str(), infer_column_type(&rows, idx), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let file =
        File::create(path).map_err(|err| io_error(format!("failed creating export: {err}")))?;
    let mut writer =
        FileWriter::try_new(file, &schema).map_err(|err| io_error(err.to_string()))?;

    if !stream.columns.is_empty() {
        let arrays: Vec<ArrayRef> = schema
            .fields()
            .iter()
            .enumerate()
            .map(|(idx, field)| build_column(&rows, idx, field.data_type()))
            .collect();
        let batch = RecordBatch::try_new(schema.clone(), arrays)
            .map_err(|err| io_error(err.to_string()))?;
        writer.write(&batch).map_err(|err| io_error(err.to_string()))?;
    }

    writer.finish().map_err(|err| io_error(err.to_string()))?;
    Ok(rows.len() as u64)
}

/// Single arrow type per column: homogeneous int stays Int64, int mixed
/// with float promotes to Float64, anything else degrades to Utf8.
fn infer_column_type(rows: &[Vec<CellValue>], idx: usize) -> DataType {
    let mut seen_int = false;
    let mut seen_float = false;
    let mut seen_bool = false;
    let mut seen_bytes = false;
    let mut seen_other = false;

    for row in rows {
        match row.get(idx) {
            Some(CellValue::Null) | None => {}
            Some(CellValue::Int(_)) => seen_int = true,
            Some(CellValue::Float(_)) => seen_float = true,
            Some(CellValue::Bool(_)) => seen_bool = true,
            Some(CellValue::Bytes(_)) => seen_bytes = true,
            Some(CellValue::Text(_)) => seen_other = true,
        }
    }

    match (seen_int, seen_float, seen_bool, seen_bytes, seen_other) {
        (true, false, false, false, false) => DataType::Int64,
        (_, true, false, false, false) => DataType::Float64,
        (false, false, true, false, false) => DataType::Boolean,
        (false, false, false, true, false) => DataType::Binary,
        _ => DataType::Utf8,
    }
}

fn build_column(rows: &[Vec<CellValue>], idx: usize, data_type: &DataType) -> ArrayRef {
    match data_type {
        DataType::Int64 => {
            let mut builder = Int64Builder::with_capacity(rows.len());
            for row in rows {
                match row.get(idx) {
                    Some(CellValue::Int(v)) => builder.append_value(*v),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Float64 => {
            let mut builder = Float64Builder::with_capacity(rows.len());
            for row in rows {
                match row.get(idx) {
                    Some(CellValue::Int(v)) => builder.append_value(*v as f64),
                    Some(CellValue::Float(v)) => builder.append_value(*v),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(rows.len());
            for row in rows {
                match row.get(idx) {
                    Some(CellValue::Bool(v)) => builder.append_value(*v),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for row in rows {
                match row.get(idx) {
                    Some(CellValue::Bytes(v)) => builder.append_value(v),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
        _ => {
            let mut builder = StringBuilder::new();
            for row in rows {
                match row.get(idx) {
                    Some(cell) if !cell.is_null() => builder.append_value(cell.to_field()),
                    _ => builder.append_null(),
                }
            }
            Arc::new(builder.finish())
        }
    }
}

/// Pulls the next row, racing the cancellation signal so a stalled
/// producer can never pin a worker past the shutdown grace.
async fn next_row(
    stream: &mut QueryStream,
    token: &CancellationToken,
) -> Result<Option<Vec<CellValue>>, JobError> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(JobError::canceled()),
        row = stream.rows.recv() => match row {
            Some(Ok(row)) => Ok(Some(row)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        },
    }
}

fn io_error(detail: String) -> JobError {
    JobError::new(ErrorKind::ExportIo, detail)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::{default_remote_filename, export_rows, spool_path};
    use crate::errors::{ErrorKind, JobError};
    use crate::executor::QueryStream;
    use crate::models::{CellValue, ExportFormat};

    fn stream_of(
        columns: &[&str],
        rows: Vec<Result<Vec<CellValue>, JobError>>,
    ) -> QueryStream {
        let (tx, rx) = mpsc::channel(rows.len().max(1));
        for row in rows {
            tx.try_send(row).expect("channel sized for rows");
        }
        drop(tx);
        QueryStream {
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows: rx,
        }
    }

    #[test]
    fn spool_path_is_deterministic() {
        let path = spool_path(Path::new("/spool"), 7, 42, ExportFormat::Excel);
        assert_eq!(path, Path::new("/spool/7/42.xlsx"));
    }

    #[test]
    fn generated_filename_carries_id_and_extension() {
        let name = default_remote_filename(9, ExportFormat::Feather);
        assert!(name.starts_with("query_9_"));
        assert!(name.ends_with(".feather"));
    }

    #[tokio::test]
    async fn csv_export_quotes_strings_and_counts_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let stream = stream_of(
            &["id", "name"],
            vec![
                Ok(vec![CellValue::Int(1), CellValue::Text("ada".into())]),
                Ok(vec![CellValue::Int(2), CellValue::Null]),
            ],
        );

        let summary = export_rows(stream, ExportFormat::Csv, &path, &CancellationToken::new())
            .await
            .expect("export succeeds");

        assert_eq!(summary.row_count, 2);
        assert_eq!(summary.column_count, 2);
        let contents = std::fs::read_to_string(&path).expect("read export");
        assert_eq!(contents, "\"id\",\"name\"\n1,\"ada\"\n2,\"\"\n");
        assert_eq!(summary.byte_size, contents.len() as u64);
    }

    #[tokio::test]
    async fn json_export_is_an_array_of_objects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let stream = stream_of(
            &["n", "ok"],
            vec![Ok(vec![CellValue::Float(1.5), CellValue::Bool(true)])],
        );

        export_rows(stream, ExportFormat::Json, &path, &CancellationToken::new())
            .await
            .expect("export succeeds");

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read export"))
                .expect("valid json");
        assert_eq!(value, serde_json::json!([{"n": 1.5, "ok": true}]));
    }

    #[tokio::test]
    async fn failed_stream_removes_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.csv");
        let stream = stream_of(
            &["id"],
            vec![
                Ok(vec![CellValue::Int(1)]),
                Err(JobError::new(ErrorKind::DbExecute, "table vanished")),
            ],
        );

        let err = export_rows(stream, ExportFormat::Csv, &path, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::DbExecute);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn cancellation_removes_partial_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.json");
        let token = CancellationToken::new();
        token.cancel();
        let stream = stream_of(&["id"], vec![Ok(vec![CellValue::Int(1)])]);

        let err = export_rows(stream, ExportFormat::Json, &path, &token)
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Canceled);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn feather_export_writes_a_columnar_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.feather");
        let stream = stream_of(
            &["id", "score"],
            vec![
                Ok(vec![CellValue::Int(1), CellValue::Float(0.5)]),
                Ok(vec![CellValue::Int(2), CellValue::Null]),
            ],
        );

        let summary = export_rows(
            stream,
            ExportFormat::Feather,
            &path,
            &CancellationToken::new(),
        )
        .await
        .expect("export succeeds");

        assert_eq!(summary.row_count, 2);
        assert!(summary.byte_size > 0);

        let file = std::fs::File::open(&path).expect("open export");
        let reader =
            arrow::ipc::reader::FileReader::try_new(file, None).expect("valid ipc file");
        let schema = reader.schema();
        assert_eq!(schema.field(0).data_type(), &arrow::datatypes::DataType::Int64);
        assert_eq!(
            schema.field(1).data_type(),
            &arrow::datatypes::DataType::Float64
        );
        let batches: Vec<_> = reader.collect::<Result<_, _>>().expect("read batches");
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 2);
    }
}
