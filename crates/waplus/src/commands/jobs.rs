use anyhow::Result;
use comfy_table::Table;
use waplus_core::db::DbPool;
use waplus_core::store::{JobStore, PgStore};
use waplus_core::types::Checksum;
use waplus_parser::ParserRegistry;

pub async fn status(pool: DbPool, checksum: &str) -> Result<()> {
    let store = PgStore::new(pool);
    match store.status(&Checksum::from_hex(checksum)).await? {
        Some(status) => println!("{}", serde_json::to_string_pretty(&status)?),
        None => println!("No jobs recorded for {checksum}"),
    }
    Ok(())
}

pub async fn history(pool: DbPool, checksum: &str) -> Result<()> {
    let store = PgStore::new(pool);
    let jobs = store.history(&Checksum::from_hex(checksum)).await?;
    if jobs.is_empty() {
        println!("No jobs recorded for {checksum}");
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec![
        "Job", "File", "State", "Attempts", "Loaded", "Rejected", "Created", "Finished", "Error",
    ]);
    for job in jobs {
        table.add_row(vec![
            job.job_id.to_string(),
            job.uri,
            job.state.to_string(),
            job.attempt_count.to_string(),
            job.records_loaded.to_string(),
            job.records_rejected.to_string(),
            job.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            job.finished_at
                .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            job.last_error.unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

pub fn formats() {
    let mut table = Table::new();
    table.set_header(vec!["Format", "Capability"]);
    for (format, capability) in ParserRegistry::standard().formats() {
        table.add_row(vec![format, capability.as_str()]);
    }
    println!("{table}");
}
