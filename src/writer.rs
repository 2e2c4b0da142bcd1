//! Snapshot-to-file writers: encode to a `.tmp` file in
//! the outbox directory, then atomically rename to the final name. A
//! write that fails partway removes the temp file and drops the
//! snapshot — it is not retried, since the next minute's snapshot
//! supersedes it.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use parquet::basic::Compression;
use parquet::column::writer::ColumnWriter;
use parquet::data_type::ByteArray;
use parquet::file::properties::WriterProperties;
use parquet::file::writer::SerializedFileWriter;
use parquet::schema::parser::parse_message_type;
use parquet::schema::types::Type as SchemaType;

use crate::error::Result;
use crate::model::{HistogramSnapshot, SessionRecord};
use crate::wire::message::{label_slots, LABEL_SLOTS};

pub const HISTOGRAM_BASE: &str = "dns_histogram";
const SESSION_BASE: &str = "dns_session_block";

pub fn outbox_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("outbox")
}

pub fn sent_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("sent")
}

/// Session blocks never pass through the outbox/sent handoff the sender
/// sweeps — they get their own subtree.
pub fn session_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("parquet").join("sessions")
}

/// UTC timestamp with colons swapped for dashes so the resulting filename
/// is safe to pass unquoted to a shell.
pub fn shell_safe_timestamp(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string().replace(':', "-")
}

/// `<base>-<startTS>_<stopTS>.parquet`.
pub fn filename_for(base: &str, start: SystemTime, stop: SystemTime) -> String {
    format!("{base}-{}_{}.parquet", shell_safe_timestamp(start), shell_safe_timestamp(stop))
}

fn atomic_write(outbox: &Path, final_name: &str, encode: impl FnOnce(&Path) -> Result<()>) -> Result<PathBuf> {
    std::fs::create_dir_all(outbox)?;
    let tmp_path = outbox.join(format!("{final_name}.tmp"));
    let final_path = outbox.join(final_name);

    match encode(&tmp_path) {
        Ok(()) => {
            std::fs::rename(&tmp_path, &final_path)?;
            Ok(final_path)
        }
        Err(e) => {
            let _ = std::fs::remove_file(&tmp_path);
            Err(e)
        }
    }
}

fn histogram_schema() -> Arc<SchemaType> {
    Arc::new(
        parse_message_type(
            "message histogram_entry {
                REQUIRED BYTE_ARRAY domain (UTF8);
                REQUIRED INT32 status;
                REQUIRED INT64 query_count;
                REQUIRED INT64 nx_count;
                REQUIRED BYTE_ARRAY rcode_counts;
                REQUIRED BYTE_ARRAY qtype_counts;
                REQUIRED BYTE_ARRAY qclass_counts;
                REQUIRED BYTE_ARRAY client_sketch_v4;
                REQUIRED BYTE_ARRAY client_sketch_v6;
                REQUIRED BYTE_ARRAY label_slot_0 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_1 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_2 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_3 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_4 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_5 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_6 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_7 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_8 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_9 (UTF8);
            }",
        )
        .expect("static schema literal always parses"),
    )
}

/// Writes one minute's histogram snapshot. Returns `None` without
/// touching the outbox if the window had no traffic against the
/// well-known dictionary — an empty file would only confuse the sender
/// and the cleaner.
pub fn write_histogram(snapshot: &mut HistogramSnapshot, data_dir: &Path) -> Result<Option<PathBuf>> {
    if snapshot.entries.is_empty() {
        return Ok(None);
    }

    let outbox = outbox_dir(data_dir);
    let name = filename_for(HISTOGRAM_BASE, snapshot.start, snapshot.stop);
    let dictionary = snapshot.dictionary.clone();

    let path = atomic_write(&outbox, &name, |tmp_path| {
        let file = File::create(tmp_path)?;
        let schema = histogram_schema();
        let props = Arc::new(WriterProperties::builder().set_compression(Compression::ZSTD(Default::default())).build());
        let mut writer = SerializedFileWriter::new(file, schema, props).map_err(parquet_err)?;
        let mut row_group = writer.next_row_group().map_err(parquet_err)?;

        let slots: Vec<[Option<String>; LABEL_SLOTS]> = snapshot
            .entries
            .iter()
            .map(|e| label_slots(dictionary.name_for(e.index).unwrap_or("")))
            .collect();

        write_byte_array_column(&mut row_group, snapshot.entries.iter().map(|e| {
            let labels = dictionary.name_for(e.index).unwrap_or("");
            ByteArray::from(labels.as_bytes().to_vec())
        }))?;
        write_i32_column(&mut row_group, snapshot.entries.iter().map(|e| e.status as i32))?;
        write_i64_column(&mut row_group, snapshot.entries.iter().map(|e| e.query_count as i64))?;
        write_i64_column(&mut row_group, snapshot.entries.iter().map(|e| e.nx_count as i64))?;
        write_byte_array_column(&mut row_group, snapshot.entries.iter().map(|e| {
            ByteArray::from(bincode::serialize(&e.rcode_counts).unwrap_or_default())
        }))?;
        write_byte_array_column(&mut row_group, snapshot.entries.iter().map(|e| {
            let map: std::collections::HashMap<String, u64> =
                e.qtype_counts.iter().map(|(k, v)| (format!("{k:?}"), *v)).collect();
            ByteArray::from(serde_json::to_vec(&map).unwrap_or_default())
        }))?;
        write_byte_array_column(&mut row_group, snapshot.entries.iter().map(|e| {
            let map: std::collections::HashMap<String, u64> =
                e.qclass_counts.iter().map(|(k, v)| (format!("{k:?}"), *v)).collect();
            ByteArray::from(serde_json::to_vec(&map).unwrap_or_default())
        }))?;

        let mut v4_sketches = Vec::with_capacity(snapshot.entries.len());
        let mut v6_sketches = Vec::with_capacity(snapshot.entries.len());
        for entry in &snapshot.entries {
            let (v4, v6) = entry.client_sketch.to_bytes()?;
            v4_sketches.push(v4);
            v6_sketches.push(v6);
        }
        write_byte_array_column(&mut row_group, v4_sketches.into_iter().map(ByteArray::from))?;
        write_byte_array_column(&mut row_group, v6_sketches.into_iter().map(ByteArray::from))?;

        for slot_index in 0..LABEL_SLOTS {
            write_byte_array_column(
                &mut row_group,
                slots.iter().map(|s| ByteArray::from(s[slot_index].as_deref().unwrap_or("").as_bytes().to_vec())),
            )?;
        }

        row_group.close().map_err(parquet_err)?;
        writer.close().map_err(parquet_err)?;
        Ok(())
    })?;

    Ok(Some(path))
}

fn session_schema() -> Arc<SchemaType> {
    Arc::new(
        parse_message_type(
            "message session_record {
                REQUIRED BYTE_ARRAY query_address;
                REQUIRED BYTE_ARRAY response_address;
                REQUIRED INT32 query_port;
                REQUIRED INT32 response_port;
                REQUIRED BYTE_ARRAY qname (UTF8);
                REQUIRED BYTE_ARRAY qtype (UTF8);
                REQUIRED BYTE_ARRAY qclass (UTF8);
                REQUIRED BYTE_ARRAY response_code (UTF8);
                REQUIRED BYTE_ARRAY identity (UTF8);
                REQUIRED BYTE_ARRAY transport (UTF8);
                REQUIRED INT64 query_time_us;
                REQUIRED INT64 response_time_us;
                REQUIRED BYTE_ARRAY label_slot_0 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_1 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_2 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_3 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_4 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_5 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_6 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_7 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_8 (UTF8);
                REQUIRED BYTE_ARRAY label_slot_9 (UTF8);
            }",
        )
        .expect("static schema literal always parses"),
    )
}

/// Writes one batch of session records into its own subtree, separate
/// from the histogram outbox the sender sweeps.
pub fn write_sessions(records: &[SessionRecord], data_dir: &Path, start: SystemTime, stop: SystemTime) -> Result<Option<PathBuf>> {
    if records.is_empty() {
        return Ok(None);
    }

    let outbox = session_dir(data_dir);
    let name = filename_for(SESSION_BASE, start, stop);

    let path = atomic_write(&outbox, &name, |tmp_path| {
        let file = File::create(tmp_path)?;
        let schema = session_schema();
        let props = Arc::new(WriterProperties::builder().set_compression(Compression::ZSTD(Default::default())).build());
        let mut writer = SerializedFileWriter::new(file, schema, props).map_err(parquet_err)?;
        let mut row_group = writer.next_row_group().map_err(parquet_err)?;

        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(r.query_address.clone())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(r.response_address.clone())))?;
        write_i32_column(&mut row_group, records.iter().map(|r| r.query_port as i32))?;
        write_i32_column(&mut row_group, records.iter().map(|r| r.response_port as i32))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(r.qname.as_bytes().to_vec())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(format!("{:?}", r.qtype).into_bytes())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(format!("{:?}", r.qclass).into_bytes())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(format!("{:?}", r.response_code).into_bytes())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(r.identity.clone().unwrap_or_default().into_bytes())))?;
        write_byte_array_column(&mut row_group, records.iter().map(|r| ByteArray::from(format!("{:?}", r.transport).into_bytes())))?;
        write_i64_column(&mut row_group, records.iter().map(|r| r.query_time_us.unwrap_or(0)))?;
        write_i64_column(&mut row_group, records.iter().map(|r| r.response_time_us.unwrap_or(0)))?;

        for slot_index in 0..LABEL_SLOTS {
            write_byte_array_column(
                &mut row_group,
                records.iter().map(|r| ByteArray::from(r.label_slots[slot_index].as_deref().unwrap_or("").as_bytes().to_vec())),
            )?;
        }

        row_group.close().map_err(parquet_err)?;
        writer.close().map_err(parquet_err)?;
        Ok(())
    })?;

    Ok(Some(path))
}

fn parquet_err(e: parquet::errors::ParquetError) -> crate::error::Error {
    crate::error::Error::Parquet(e)
}

fn write_i32_column(
    row_group: &mut parquet::file::writer::SerializedRowGroupWriter<'_, File>,
    values: impl Iterator<Item = i32>,
) -> Result<()> {
    let values: Vec<i32> = values.collect();
    let mut col_writer = row_group.next_column().map_err(parquet_err)?.expect("schema column present");
    if let ColumnWriter::Int32ColumnWriter(ref mut typed) = col_writer {
        typed.write_batch(&values, None, None).map_err(parquet_err)?;
    }
    col_writer.close().map_err(parquet_err)?;
    Ok(())
}

fn write_i64_column(
    row_group: &mut parquet::file::writer::SerializedRowGroupWriter<'_, File>,
    values: impl Iterator<Item = i64>,
) -> Result<()> {
    let values: Vec<i64> = values.collect();
    let mut col_writer = row_group.next_column().map_err(parquet_err)?.expect("schema column present");
    if let ColumnWriter::Int64ColumnWriter(ref mut typed) = col_writer {
        typed.write_batch(&values, None, None).map_err(parquet_err)?;
    }
    col_writer.close().map_err(parquet_err)?;
    Ok(())
}

fn write_byte_array_column(
    row_group: &mut parquet::file::writer::SerializedRowGroupWriter<'_, File>,
    values: impl Iterator<Item = ByteArray>,
) -> Result<()> {
    let values: Vec<ByteArray> = values.collect();
    let mut col_writer = row_group.next_column().map_err(parquet_err)?.expect("schema column present");
    if let ColumnWriter::ByteArrayColumnWriter(ref mut typed) = col_writer {
        typed.write_batch(&values, None, None).map_err(parquet_err)?;
    }
    col_writer.close().map_err(parquet_err)?;
    Ok(())
}

/// Deletes `sent/` files matching the histogram naming pattern older than
/// the 12-hour retention window.
pub async fn run_cleaner(data_dir: PathBuf, retention: Duration, cancel: tokio_util::sync::CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => return,
        }

        let sent = sent_dir(&data_dir);
        let Ok(entries) = std::fs::read_dir(&sent) else { continue };
        let cutoff = SystemTime::now() - retention;
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else { continue };
            if !name.starts_with(HISTOGRAM_BASE) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                if let Ok(modified) = metadata.modified() {
                    if modified < cutoff {
                        let _ = std::fs::remove_file(&path);
                    }
                }
            }
        }
    }
}
