use stepflow_core::config::AppConfig;
use stepflow_store::SqliteStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

/// Print a health report for the loaded configuration. Returns the number of issues.
pub fn run_doctor(config: &AppConfig) -> usize {
    let checks = vec![
        check_data_dir(config),
        check_database(config),
        check_agents(config),
        check_retry(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
    fail_count
}

fn check_data_dir(config: &AppConfig) -> CheckResult {
    let dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&dir) {
        return CheckResult {
            label: "Data dir".into(),
            ok: false,
            detail: format!("{} (cannot create: {})", dir.display(), e),
        };
    }
    let probe = dir.join(".doctor_test");
    match std::fs::write(&probe, "test") {
        Ok(_) => {
            std::fs::remove_file(&probe).ok();
            CheckResult {
                label: "Data dir".into(),
                ok: true,
                detail: format!("{}", dir.display()),
            }
        }
        Err(e) => CheckResult {
            label: "Data dir".into(),
            ok: false,
            detail: format!("{} (not writable: {})", dir.display(), e),
        },
    }
}

fn check_database(config: &AppConfig) -> CheckResult {
    let db_path = config.database_path();
    match SqliteStore::open(&db_path) {
        Ok(_) => CheckResult {
            label: "Database".into(),
            ok: true,
            detail: format!("{}", db_path.display()),
        },
        Err(e) => CheckResult {
            label: "Database".into(),
            ok: false,
            detail: format!("{}: {}", db_path.display(), e),
        },
    }
}

fn check_agents(config: &AppConfig) -> CheckResult {
    if config.agents.is_empty() {
        return CheckResult {
            label: "Agents".into(),
            ok: false,
            detail: "no [agents.<id>] endpoints configured".into(),
        };
    }

    let mut issues = Vec::new();
    let mut ids: Vec<&String> = config.agents.keys().collect();
    ids.sort();
    for id in &ids {
        let endpoint = &config.agents[*id];
        if !(endpoint.url.starts_with("http://") || endpoint.url.starts_with("https://")) {
            issues.push(format!("{}: url '{}' is not http(s)", id, endpoint.url));
        }
        for (name, value) in &endpoint.headers {
            // Left verbatim when the variable was not set at load time.
            if value.contains("${") {
                issues.push(format!("{}: header {} references an unset variable", id, name));
            }
        }
    }

    if issues.is_empty() {
        CheckResult {
            label: "Agents".into(),
            ok: true,
            detail: ids
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    } else {
        CheckResult {
            label: "Agents".into(),
            ok: false,
            detail: issues.join("; "),
        }
    }
}

fn check_retry(config: &AppConfig) -> CheckResult {
    let retry = &config.retry;
    if retry.base_delay_ms > retry.max_delay_ms {
        return CheckResult {
            label: "Retry".into(),
            ok: false,
            detail: format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                retry.base_delay_ms, retry.max_delay_ms
            ),
        };
    }
    CheckResult {
        label: "Retry".into(),
        ok: true,
        detail: format!(
            "{} attempts, {}ms base backoff; breaker opens after {} failures",
            retry.max_retries, retry.base_delay_ms, config.circuit_breaker.failure_threshold
        ),
    }
}
