//! Workspace backup bundles: a zip holding a consistent snapshot of the
//! database, a manifest with its sha256, and workspace metadata.

use anyhow::{anyhow, Context};
use chrono::Utc;
use rusqlite::Connection;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE;

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/escola.sqlite3";
const META_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT: &str = "escola-workspace-v1";

const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub sha256: String,
    pub db_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub format_detected: String,
    pub sha256: String,
}

fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = f.read(&mut buf).context("read for checksum")?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Copies the live database into `dst` with `VACUUM INTO`, which reads a
/// single consistent snapshot.
fn snapshot_db(conn: &Connection, dst: &Path) -> anyhow::Result<()> {
    if dst.exists() {
        std::fs::remove_file(dst).with_context(|| format!("remove stale {}", dst.display()))?;
    }
    conn.execute("VACUUM INTO ?", [dst.to_string_lossy()])
        .context("snapshot database")?;
    Ok(())
}

pub fn export_bundle(
    conn: &Connection,
    workspace: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let snapshot = out_path.with_extension("snapshot.sqlite3");
    snapshot_db(conn, &snapshot)?;
    let result = write_bundle(workspace, &snapshot, out_path);
    let _ = std::fs::remove_file(&snapshot);
    result
}

fn write_bundle(workspace: &Path, snapshot: &Path, out_path: &Path) -> anyhow::Result<ExportSummary> {
    let (sha256, db_bytes) = sha256_file(snapshot)?;

    let out_file = File::create(out_path)
        .with_context(|| format!("failed to create output file {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    let manifest = json!({
        "format": BUNDLE_FORMAT,
        "version": 1,
        "appVersion": env!("CARGO_PKG_VERSION"),
        "exportedAt": Utc::now().to_rfc3339(),
        "dbSha256": sha256,
        "dbBytes": db_bytes,
    });
    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(serde_json::to_string_pretty(&manifest)?.as_bytes())
        .context("failed to write manifest entry")?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(snapshot)
        .with_context(|| format!("failed to open snapshot {}", snapshot.display()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    let meta = json!({ "sourceWorkspace": workspace.to_string_lossy() });
    zip.start_file(META_ENTRY, opts)
        .context("failed to start workspace metadata entry")?;
    zip.write_all(serde_json::to_string_pretty(&meta)?.as_bytes())
        .context("failed to write workspace metadata entry")?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        sha256,
        db_bytes,
    })
}

/// Replaces the workspace database with the one in `in_path`: a bundle made
/// by [`export_bundle`] (checksum verified) or a raw SQLite file. The caller
/// must have closed its connection.
pub fn import_bundle(in_path: &Path, workspace: &Path) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("failed to create workspace {}", workspace.display()))?;
    let dst = workspace.join(DB_FILE);
    let tmp_dst = workspace.join(format!("{}.importing", DB_FILE));
    if tmp_dst.exists() {
        let _ = std::fs::remove_file(&tmp_dst);
    }

    let format_detected = match sniff(in_path)? {
        Kind::Sqlite => {
            std::fs::copy(in_path, &tmp_dst).with_context(|| {
                format!("failed to copy sqlite backup from {}", in_path.display())
            })?;
            "sqlite3".to_string()
        }
        Kind::Zip => {
            extract_db(in_path, &tmp_dst)?;
            BUNDLE_FORMAT.to_string()
        }
        Kind::Unknown => {
            return Err(anyhow!(
                "{} is neither a backup bundle nor a SQLite database",
                in_path.display()
            ))
        }
    };
    let (sha256, _) = sha256_file(&tmp_dst)?;

    if dst.exists() {
        std::fs::remove_file(&dst)
            .with_context(|| format!("failed to remove existing database {}", dst.display()))?;
    }
    std::fs::rename(&tmp_dst, &dst)
        .with_context(|| format!("failed to move restored database to {}", dst.display()))?;

    Ok(ImportSummary {
        format_detected,
        sha256,
    })
}

fn extract_db(in_path: &Path, tmp_dst: &Path) -> anyhow::Result<()> {
    let in_file =
        File::open(in_path).with_context(|| format!("failed to open bundle {}", in_path.display()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest.get("format").and_then(|v| v.as_str()).unwrap_or("");
    if format != BUNDLE_FORMAT {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }
    let expected = manifest
        .get("dbSha256")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("manifest.json has no dbSha256"))?
        .to_string();

    {
        let mut out = File::create(tmp_dst)
            .with_context(|| format!("failed to create temp database {}", tmp_dst.display()))?;
        let mut entry = archive
            .by_name(DB_ENTRY)
            .with_context(|| format!("bundle missing {}", DB_ENTRY))?;
        std::io::copy(&mut entry, &mut out).context("failed to extract database entry")?;
        out.flush().context("failed to flush extracted database")?;
    }

    let (actual, _) = sha256_file(tmp_dst)?;
    if actual != expected {
        let _ = std::fs::remove_file(tmp_dst);
        return Err(anyhow!(
            "checksum mismatch: manifest {} but database is {}",
            expected,
            actual
        ));
    }
    Ok(())
}

enum Kind {
    Zip,
    Sqlite,
    Unknown,
}

fn sniff(path: &Path) -> anyhow::Result<Kind> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.display()))?;
    let mut head = [0u8; 16];
    let mut read = 0;
    while read < head.len() {
        let n = f.read(&mut head[read..]).context("failed to read file signature")?;
        if n == 0 {
            break;
        }
        read += n;
    }
    if read >= 4 && head[..4] == ZIP_MAGIC {
        return Ok(Kind::Zip);
    }
    if read == 16 && &head == SQLITE_MAGIC {
        return Ok(Kind::Sqlite);
    }
    Ok(Kind::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace_with_row(dir: &Path) -> Connection {
        let conn = Connection::open(dir.join(DB_FILE)).unwrap();
        conn.execute_batch("CREATE TABLE t(v TEXT); INSERT INTO t VALUES('kept');")
            .unwrap();
        conn
    }

    #[test]
    fn bundle_round_trips_the_database() {
        let src = tempfile::tempdir().unwrap();
        let conn = workspace_with_row(src.path());
        let out = src.path().join("backups/b.zip");
        let summary = export_bundle(&conn, src.path(), &out).unwrap();
        assert_eq!(summary.sha256.len(), 64);
        assert!(!out.with_extension("snapshot.sqlite3").exists());

        let dst = tempfile::tempdir().unwrap();
        let imported = import_bundle(&out, dst.path()).unwrap();
        assert_eq!(imported.format_detected, BUNDLE_FORMAT);
        assert_eq!(imported.sha256, summary.sha256);
        let back = Connection::open(dst.path().join(DB_FILE)).unwrap();
        let v: String = back.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, "kept");
    }

    #[test]
    fn raw_sqlite_files_are_accepted() {
        let src = tempfile::tempdir().unwrap();
        drop(workspace_with_row(src.path()));
        let dst = tempfile::tempdir().unwrap();
        let imported = import_bundle(&src.path().join(DB_FILE), dst.path()).unwrap();
        assert_eq!(imported.format_detected, "sqlite3");
    }

    #[test]
    fn tampered_bundle_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        let out = src.path().join("bad.zip");
        {
            let mut zip = ZipWriter::new(File::create(&out).unwrap());
            let opts = FileOptions::default();
            zip.start_file(MANIFEST_ENTRY, opts).unwrap();
            zip.write_all(
                json!({"format": BUNDLE_FORMAT, "dbSha256": "00"}).to_string().as_bytes(),
            )
            .unwrap();
            zip.start_file(DB_ENTRY, opts).unwrap();
            zip.write_all(b"not really a database").unwrap();
            zip.finish().unwrap();
        }
        let dst = tempfile::tempdir().unwrap();
        let e = import_bundle(&out, dst.path()).unwrap_err();
        assert!(format!("{e:#}").contains("checksum mismatch"));
        assert!(!dst.path().join(DB_FILE).exists());
    }

    #[test]
    fn unknown_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("notes.txt");
        std::fs::write(&p, "hello").unwrap();
        assert!(import_bundle(&p, dir.path()).is_err());
    }
}
