//! File submission and ingest job commands

use anyhow::{anyhow, Context, Result};

use glean_core::{GleanCore, JobState};

pub fn cmd_submit(core: &GleanCore, tenant: &str, path: &str) -> Result<()> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path))?;
    let filename = std::path::Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path);

    let file = core.submit_raw_file(tenant, filename, &bytes)?;
    println!(
        "Submitted raw file {} ({} bytes, status {})",
        file.id, file.size_bytes, file.status
    );
    println!("Ingest with: glean -t {} import --file-id {}", tenant, file.id);
    Ok(())
}

pub async fn cmd_import(
    core: &GleanCore,
    tenant: &str,
    file: Option<&str>,
    file_id: Option<i64>,
) -> Result<()> {
    let file_id = match (file, file_id) {
        (Some(path), None) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path))?;
            let filename = std::path::Path::new(path)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(path);
            let raw = core.submit_raw_file(tenant, filename, &bytes)?;
            println!("Submitted raw file {}", raw.id);
            raw.id
        }
        (None, Some(id)) => id,
        _ => return Err(anyhow!("pass exactly one of --file or --file-id")),
    };

    let job_id = core.start_ingest(tenant, file_id)?;
    println!("Started ingest job {}", job_id);

    let progress = core.wait_for_job(tenant, job_id).await?;
    print_progress(&progress);

    if progress.state == JobState::Failed {
        return Err(anyhow!(
            "ingest failed: {}",
            progress.error.unwrap_or_else(|| "unknown error".to_string())
        ));
    }
    Ok(())
}

pub async fn cmd_resume(core: &GleanCore, tenant: &str, file_id: i64) -> Result<()> {
    let job_id = core.resume_ingest(tenant, file_id)?;
    println!("Resumed ingest as job {}", job_id);

    let progress = core.wait_for_job(tenant, job_id).await?;
    print_progress(&progress);
    Ok(())
}

pub fn cmd_job_status(core: &GleanCore, tenant: &str, job_id: i64) -> Result<()> {
    let progress = core.job_status(tenant, job_id)?;
    print_progress(&progress);
    Ok(())
}

pub fn cmd_job_rejected(core: &GleanCore, tenant: &str, job_id: i64) -> Result<()> {
    let rows = core.rejected_rows(tenant, job_id)?;
    if rows.is_empty() {
        println!("No rejected rows for job {}", job_id);
        return Ok(());
    }
    println!("{:<8} REASON", "ROW");
    for r in rows {
        println!("{:<8} {}", r.row_index_in_file, r.reason);
    }
    Ok(())
}

fn print_progress(progress: &glean_core::JobProgress) {
    println!(
        "Job {}: {} | total {} processed {} accepted {} duplicate {} rejected {}",
        progress.job_id,
        progress.state,
        progress.rows_total,
        progress.rows_processed,
        progress.rows_accepted,
        progress.rows_duplicate,
        progress.rows_rejected,
    );
    if let Some(ref error) = progress.error {
        println!("  error: {}", error);
    }
}
