mod cli;

use std::io::IsTerminal;
use std::path::PathBuf;

use clap::ArgMatches;

use hashall::catalog::Catalog;
use hashall::catalog::plans::ActionStatus;
use hashall::error::Result;
use hashall::execute::{ExecuteOptions, VerifyMode};
use hashall::hash::HashMode;
use hashall::scan::ScanOptions;
use hashall::{analyze, collide, execute, export, plan, scan};

fn main() {
    hashall::logging::init();
    let matches = cli::command().get_matches();
    match run(&matches) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}

fn run(matches: &ArgMatches) -> Result<i32> {
    match matches.subcommand() {
        Some(("scan", m)) => run_scan(m),
        Some(("link", m)) => match m.subcommand() {
            Some(("analyze", m)) => run_analyze(m),
            Some(("plan", m)) => run_plan(m),
            Some(("show-plan", m)) => run_show_plan(m),
            Some(("list-plans", _)) => run_list_plans(),
            Some(("execute", m)) => run_execute(m),
            Some(("cancel", m)) => run_cancel(m),
            _ => unreachable!("subcommand required"),
        },
        Some(("devices", m)) => match m.subcommand() {
            Some(("list", _)) => run_devices_list(),
            Some(("show", m)) => run_devices_show(m),
            Some(("alias", m)) => run_devices_alias(m),
            _ => unreachable!("subcommand required"),
        },
        Some(("export", m)) => run_export(m),
        Some(("stats", _)) => run_stats(),
        _ => unreachable!("subcommand required"),
    }
}

fn run_scan(m: &ArgMatches) -> Result<i32> {
    let root = PathBuf::from(m.get_one::<String>("root").expect("required"));
    let hash_mode: HashMode = m.get_one::<String>("hash-mode").expect("defaulted").parse()?;
    let workers = match m.get_one::<usize>("workers") {
        Some(n) => *n,
        None if m.get_flag("parallel") => 0,
        None => 1,
    };

    let mut catalog = Catalog::open_default()?;
    let options = ScanOptions {
        hash_mode,
        workers,
        progress: std::io::stderr().is_terminal(),
        ..Default::default()
    };
    let stats = scan::scan(&mut catalog, &root, &options)?;
    println!(
        "scan #{} on device {}: {} files, {} added, {} updated, {} unchanged, {} deleted, {} errors{}",
        stats.scan_id,
        stats.device_id,
        stats.files_seen,
        stats.added,
        stats.updated,
        stats.unchanged,
        stats.deleted,
        stats.errors,
        if stats.cancelled { " (cancelled)" } else { "" },
    );
    Ok(0)
}

fn run_analyze(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let device = catalog.device_by_selector(m.get_one::<String>("device").expect("required"))?;
    let min_size = *m.get_one::<u64>("min-size").expect("defaulted");

    let promotion = collide::promote_all(&catalog, &device)?;
    println!(
        "promotion: {} collision groups, {} hashed, {} already hashed, {} errors",
        promotion.groups, promotion.hashed, promotion.skipped, promotion.errors
    );

    let report = analyze::find_duplicates(&catalog, device.device_id, min_size)?;
    for group in &report.groups {
        println!(
            "{}  {} files / {} inodes x {}  saveable {}",
            &group.sha256[..16.min(group.sha256.len())],
            group.file_count,
            group.inode_count,
            human_bytes(group.size),
            human_bytes(group.saveable_bytes),
        );
    }
    println!(
        "{} duplicate groups, {} saveable",
        report.groups.len(),
        human_bytes(report.total_saveable)
    );
    Ok(0)
}

fn run_plan(m: &ArgMatches) -> Result<i32> {
    let mut catalog = Catalog::open_default()?;
    let device = catalog.device_by_selector(m.get_one::<String>("device").expect("required"))?;
    let name = m.get_one::<String>("name").expect("required");
    let min_size = *m.get_one::<u64>("min-size").expect("defaulted");

    let plan_id = plan::create_plan(&mut catalog, name, &device, min_size)?;
    let plan = catalog.get_plan(plan_id)?;
    println!(
        "plan {} '{}': {} hardlink opportunities, {} saveable",
        plan_id,
        plan.name,
        plan.opportunities,
        human_bytes(plan.total_bytes_saveable)
    );
    Ok(0)
}

fn run_show_plan(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let plan_id = *m.get_one::<i64>("plan-id").expect("required");
    let plan = catalog.get_plan(plan_id)?;
    println!(
        "plan {} '{}' on device {}: {} [{} opportunities, {} saveable, {} executed, {} failed, {} skipped, {} saved]",
        plan.plan_id,
        plan.name,
        plan.device_id,
        plan.status.as_str(),
        plan.opportunities,
        human_bytes(plan.total_bytes_saveable),
        plan.executed,
        plan.failed,
        plan.skipped,
        human_bytes(plan.bytes_saved),
    );
    for action in catalog.plan_actions(plan_id)? {
        println!(
            "  #{} {} {} {} -> {}{}",
            action.action_id,
            action.action_type.as_str(),
            action.status.as_str(),
            action.source_path,
            action.target_path,
            action
                .error_message
                .map(|e| format!("  ({e})"))
                .unwrap_or_default(),
        );
    }
    Ok(0)
}

fn run_list_plans() -> Result<i32> {
    let catalog = Catalog::open_default()?;
    for plan in catalog.list_plans()? {
        println!(
            "{:>4}  {:<12}  dev {:<6}  {:<16}  {:>5} opportunities  {:>10} saveable  {}",
            plan.plan_id,
            plan.status.as_str(),
            plan.device_id,
            plan.name,
            plan.opportunities,
            human_bytes(plan.total_bytes_saveable),
            format_ts(plan.created_at),
        );
    }
    Ok(0)
}

fn run_execute(m: &ArgMatches) -> Result<i32> {
    let mut catalog = Catalog::open_default()?;
    let plan_id = *m.get_one::<i64>("plan-id").expect("required");
    let options = ExecuteOptions {
        verify: m
            .get_one::<String>("verify")
            .expect("defaulted")
            .parse::<VerifyMode>()?,
        dry_run: m.get_flag("dry-run"),
        no_backup: m.get_flag("no-backup"),
        limit: m.get_one::<usize>("limit").copied(),
        ..Default::default()
    };

    if !options.dry_run && !m.get_flag("yes") {
        let plan = catalog.get_plan(plan_id)?;
        let pending = catalog
            .plan_actions(plan_id)?
            .iter()
            .filter(|a| a.status == ActionStatus::Pending)
            .count();
        let prompt = format!(
            "Execute plan {} '{}' ({} pending actions, up to {} to replace)?",
            plan_id,
            plan.name,
            pending,
            human_bytes(plan.total_bytes_saveable)
        );
        let confirmed = inquire::Confirm::new(&prompt)
            .with_default(false)
            .prompt()
            .unwrap_or(false);
        if !confirmed {
            println!("aborted");
            return Ok(1);
        }
    }

    let stats = execute::execute(&mut catalog, plan_id, &options)?;
    println!(
        "{}: {} attempted, {} executed, {} failed, {} skipped, {} saved, {} still pending",
        if stats.dry_run { "dry run" } else { "executed" },
        stats.attempted,
        stats.executed,
        stats.failed,
        stats.skipped,
        human_bytes(stats.bytes_saved),
        stats.remaining_pending,
    );
    if stats.failed > 0 { Ok(5) } else { Ok(0) }
}

fn run_cancel(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let plan_id = *m.get_one::<i64>("plan-id").expect("required");
    catalog.cancel_plan(plan_id)?;
    println!("plan {plan_id} cancelled");
    Ok(0)
}

fn run_devices_list() -> Result<i32> {
    let catalog = Catalog::open_default()?;
    for device in catalog.list_devices()? {
        println!(
            "{:>6}  {:<16}  {:<8}  {}  {}",
            device.device_id,
            device.alias.as_deref().unwrap_or("-"),
            device.fs_type,
            device.fs_uuid,
            device.preferred_mount_point.display(),
        );
    }
    Ok(0)
}

fn run_devices_show(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let device = catalog.device_by_selector(m.get_one::<String>("device").expect("required"))?;
    let stats = catalog.file_table_stats(device.device_id)?;
    println!("device {}", device.device_id);
    println!("  fs_uuid          {}", device.fs_uuid);
    println!("  alias            {}", device.alias.as_deref().unwrap_or("-"));
    println!("  fs_type          {}", device.fs_type);
    println!("  mount point      {}", device.mount_point.display());
    println!("  preferred mount  {}", device.preferred_mount_point.display());
    println!("  registered       {}", format_ts(device.registered_at));
    println!(
        "  files            {} active ({}), {} deleted, {} fully hashed",
        stats.active,
        human_bytes(stats.active_bytes),
        stats.deleted,
        stats.full_hashed,
    );
    for root in catalog.scan_roots(device.device_id)? {
        println!("  scan root        {root}");
    }
    Ok(0)
}

fn run_devices_alias(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let device = catalog.device_by_selector(m.get_one::<String>("device").expect("required"))?;
    let name = m.get_one::<String>("name").expect("required");
    catalog.set_device_alias(&device.fs_uuid, name)?;
    println!("device {} aliased as '{name}'", device.device_id);
    Ok(0)
}

fn run_export(m: &ArgMatches) -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let device = catalog.device_by_selector(m.get_one::<String>("device").expect("required"))?;
    let snapshot = export::export_device(&catalog, &device)?;
    export::write_json(&snapshot, std::io::stdout().lock())?;
    println!();
    Ok(0)
}

fn run_stats() -> Result<i32> {
    let catalog = Catalog::open_default()?;
    let devices = catalog.list_devices()?;
    let mut total_files = 0u64;
    let mut total_bytes = 0u64;
    for device in &devices {
        let stats = catalog.file_table_stats(device.device_id)?;
        total_files += stats.active;
        total_bytes += stats.active_bytes;
        println!(
            "device {:>6} ({}): {} active files, {}, {} fully hashed",
            device.device_id,
            device.alias.as_deref().unwrap_or(&device.fs_uuid),
            stats.active,
            human_bytes(stats.active_bytes),
            stats.full_hashed,
        );
    }
    let plans = catalog.list_plans()?;
    let saved: u64 = plans.iter().map(|p| p.bytes_saved).sum();
    println!(
        "{} devices, {} files, {}; {} plans, {} saved",
        devices.len(),
        total_files,
        human_bytes(total_bytes),
        plans.len(),
        human_bytes(saved),
    );
    Ok(0)
}

fn human_bytes(n: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = n as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{n} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_ts(ts: f64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
