//! Watcher listing and control commands

use anyhow::Result;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use crate::client::{ApiClient, WatcherReport};
use crate::output::{
    color_status, format_bytes, format_limit, format_timestamp, print_json, print_success,
    print_warning, OutputFormat,
};

/// Row for watchers table
#[derive(Tabled)]
struct WatcherRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Phase")]
    phase: String,
    #[tabled(rename = "Ticks")]
    ticks: u64,
    #[tabled(rename = "Mem")]
    memory: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "Mem Lim")]
    memory_limit: String,
    #[tabled(rename = "Cpuset")]
    cpuset: String,
}

fn progress(active: bool, windows: usize, done: bool) -> String {
    if !active {
        "-".to_string()
    } else if done {
        "done".green().to_string()
    } else {
        format!("{} win", windows)
    }
}

impl From<&WatcherReport> for WatcherRow {
    fn from(report: &WatcherReport) -> Self {
        let applied = report.applied.clone().unwrap_or_default();
        Self {
            id: report.workload.id.clone(),
            name: report.workload.name.clone(),
            service: report.workload.service.clone().unwrap_or_else(|| "-".into()),
            phase: color_status(&report.phase),
            ticks: report.ticks,
            memory: progress(
                report.autorange.contains_key("memory"),
                report.memory_windows,
                report.memory_done,
            ),
            cpu: progress(
                report.autorange.contains_key("cpu%"),
                report.cpu_windows,
                report.cpu_done,
            ),
            memory_limit: format_limit(applied.memory_limit_bytes),
            cpuset: applied.cpuset_cpus.unwrap_or_else(|| "-".into()),
        }
    }
}

/// List all watchers known to the agent
pub async fn list_watchers(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let list = client.list_watchers().await?;

    match format {
        OutputFormat::Json => print_json(&list)?,
        OutputFormat::Table => {
            if list.watchers.is_empty() {
                print_warning("No watchers found");
                return Ok(());
            }

            let rows: Vec<WatcherRow> = list.watchers.iter().map(WatcherRow::from).collect();
            let table = Table::new(rows).with(Style::rounded()).to_string();
            println!("{}", table);
            println!("\nTotal: {} watchers", list.watchers.len());
        }
    }

    Ok(())
}

/// Show one watcher with its learned values
pub async fn show_watcher(client: &ApiClient, workload_id: &str, format: OutputFormat) -> Result<()> {
    let detail = client.get_watcher(workload_id).await?;

    if let OutputFormat::Json = format {
        return print_json(&detail);
    }

    let report = &detail.report;
    println!("{}", "Watcher".bold());
    println!("{}", "=".repeat(50));
    println!("Workload:     {}", report.workload.id.cyan());
    println!("Name:         {}", report.workload.name);
    if let Some(service) = &report.workload.service {
        println!("Service:      {}", service);
    }
    println!("Cgroup:       {}", report.workload.cgroup_path);
    println!("Phase:        {}", color_status(&report.phase));
    println!("Ticks:        {}", report.ticks);
    println!("Updated:      {}", format_timestamp(&report.updated_at));

    for (category, values) in &report.autorange {
        println!();
        println!("{}", category.bold());
        println!("{}", "-".repeat(50));
        for (key, value) in values {
            println!("  {:<14}{}", key, value);
        }
    }

    if let Some(applied) = &report.applied {
        println!();
        println!("{}", "Applied limits".bold());
        println!("{}", "-".repeat(50));
        println!("  Memory limit:       {}", format_limit(applied.memory_limit_bytes));
        println!(
            "  Memory reservation: {}",
            format_limit(applied.memory_reservation_bytes)
        );
        println!("  Memory+swap:        {}", format_limit(applied.memory_swap_bytes));
        if let Some(cpuset) = &applied.cpuset_cpus {
            println!("  Cpuset:             {}", cpuset);
        }
        if let Some(runtime) = applied.cpu_realtime_runtime_us {
            println!("  RT runtime:         {}us", runtime);
        }
    }

    if let Some(latest) = &detail.latest {
        println!();
        println!("{}", "Latest sample".bold());
        println!("{}", "-".repeat(50));
        println!("  Read at:  {}", format_timestamp(&latest.read_at));
        println!("  Memory:   {}", format_bytes(latest.memory_usage_bytes));
        println!("  CPUs:     {}", latest.online_cpus);
    }

    Ok(())
}

pub async fn pause_watcher(client: &ApiClient, workload_id: &str, format: OutputFormat) -> Result<()> {
    let response = client.pause_watcher(workload_id).await?;
    match format {
        OutputFormat::Json => print_json(&response),
        OutputFormat::Table => {
            print_success(&format!("Watcher {} paused", response.workload_id));
            Ok(())
        }
    }
}

pub async fn resume_watcher(client: &ApiClient, workload_id: &str, format: OutputFormat) -> Result<()> {
    let response = client.resume_watcher(workload_id).await?;
    match format {
        OutputFormat::Json => print_json(&response),
        OutputFormat::Table => {
            print_success(&format!("Watcher {} resumed", response.workload_id));
            Ok(())
        }
    }
}
