use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::sleep;
use tracing::{debug, info, warn};

use common::config::Settings;
use common::err::CResult;
use common::utils::GracefulKiller;
use replication::db_replicator::DbReplicator;
use replication::mysql_api::MySQLApi;
use replication::state::{DbState, Status};

use crate::http;

const LIVENESS_INTERVAL: Duration = Duration::from_secs(1);
const DB_REPLICATOR_RUN_DELAY: Duration = Duration::from_secs(5);

/// A supervised child process: the current executable re-invoked with a
/// different mode. Dead children are respawned on the next liveness check.
pub struct ProcessRunner {
    args: Vec<String>,
    child: Option<tokio::process::Child>,
}

impl ProcessRunner {
    pub fn new(args: Vec<String>) -> Self {
        ProcessRunner { args, child: None }
    }

    pub fn run(&mut self) -> CResult<()> {
        let exe = std::env::current_exe()?;
        debug!("spawning {:?} {:?}", exe, self.args);
        let child = tokio::process::Command::new(exe).args(&self.args).spawn()?;
        self.child = Some(child);
        Ok(())
    }

    pub fn restart_dead_process_if_required(&mut self) -> CResult<()> {
        let running = match self.child.as_mut() {
            Some(child) => child.try_wait()?.is_none(),
            None => false,
        };
        if !running {
            warn!("restarting dead process: < {} >", self.args.join(" "));
            self.run()?;
        }
        Ok(())
    }

    /// Graceful stop: SIGINT so the child flushes and persists, then wait.
    pub async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGINT);
                }
            }
            let _ = child.wait().await;
        }
    }
}

fn binlog_replicator_args(config_file: &str) -> Vec<String> {
    vec![
        "binlog_replicator".to_string(),
        "--config".to_string(),
        config_file.to_string(),
    ]
}

fn db_replicator_args(db_name: &str, config_file: &str) -> Vec<String> {
    vec![
        "db_replicator".to_string(),
        "--config".to_string(),
        config_file.to_string(),
        "--db".to_string(),
        db_name.to_string(),
    ]
}

fn db_optimizer_args(config_file: &str) -> Vec<String> {
    vec![
        "db_optimizer".to_string(),
        "--config".to_string(),
        config_file.to_string(),
    ]
}

/// Coordination handle shared with the HTTP restart endpoint.
#[derive(Debug, Default)]
pub struct RestartFlags {
    pub need_restart_replication: AtomicBool,
    pub replication_restarted: AtomicBool,
}

/// The parent process: spawns the binlog reader, the optimizer and one
/// db_replicator per matched source database, keeps them alive, and picks
/// up created/removed databases.
pub struct Runner {
    config: Settings,
    databases_override: Option<String>,
    wait_initial_replication: bool,
    runners: HashMap<String, ProcessRunner>,
    binlog_runner: Option<ProcessRunner>,
    db_optimizer: Option<ProcessRunner>,
    restart_flags: Arc<RestartFlags>,
}

impl Runner {
    pub fn new(
        config: Settings,
        wait_initial_replication: bool,
        databases_override: Option<String>,
    ) -> Self {
        Runner {
            config,
            databases_override,
            wait_initial_replication,
            runners: HashMap::new(),
            binlog_runner: None,
            db_optimizer: None,
            restart_flags: Arc::new(RestartFlags::default()),
        }
    }

    fn database_matches(&self, db_name: &str) -> bool {
        if let Some(only) = &self.databases_override {
            if !only.split(',').any(|candidate| candidate.trim() == db_name) {
                return false;
            }
        }
        self.config.is_database_matches(db_name)
    }

    fn is_initial_replication_finished(&self, db_name: &str) -> bool {
        let state_path = DbReplicator::state_path(&self.config, db_name, None, None);
        match DbState::load(&state_path) {
            Ok(state) => state.status == Status::RunningRealtimeReplication,
            Err(_) => false,
        }
    }

    fn restart_dead_processes(&mut self) -> CResult<()> {
        for runner in self.runners.values_mut() {
            runner.restart_dead_process_if_required()?;
        }
        if let Some(runner) = self.binlog_runner.as_mut() {
            runner.restart_dead_process_if_required()?;
        }
        if let Some(runner) = self.db_optimizer.as_mut() {
            runner.restart_dead_process_if_required()?;
        }
        Ok(())
    }

    /// Handle a pending `/restart_replication` request: stop every per-DB
    /// worker, drop its state file and spawn it afresh.
    async fn restart_replication_if_required(&mut self) -> CResult<()> {
        if !self
            .restart_flags
            .need_restart_replication
            .load(Ordering::SeqCst)
        {
            return Ok(());
        }
        info!("restarting replication");
        for (db_name, runner) in self.runners.iter_mut() {
            info!("stopping runner {}", db_name);
            runner.stop().await;
            let state_path = DbReplicator::state_path(&self.config, db_name, None, None);
            if state_path.exists() {
                debug!("removing {:?}", state_path);
                std::fs::remove_file(&state_path)?;
            }
        }
        info!("starting replication");
        self.restart_dead_processes()?;
        self.restart_flags
            .need_restart_replication
            .store(false, Ordering::SeqCst);
        self.restart_flags
            .replication_restarted
            .store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Start replication for created databases, stop it for removed ones.
    async fn check_databases_updated(&mut self, mysql_api: &mut MySQLApi) -> CResult<()> {
        debug!("check if databases were created / removed in mysql");
        let databases: Vec<String> = mysql_api
            .get_databases()
            .await?
            .into_iter()
            .filter(|db| self.database_matches(db))
            .collect();
        info!("mysql databases filtered: {:?}", databases);

        for db in &databases {
            if self.runners.contains_key(db) {
                continue;
            }
            info!("running replication for {} (database created in mysql)", db);
            let mut runner =
                ProcessRunner::new(db_replicator_args(db, &self.config.settings_file));
            runner.run()?;
            self.runners.insert(db.clone(), runner);
        }

        let removed: Vec<String> = self
            .runners
            .keys()
            .filter(|db| !databases.contains(db))
            .cloned()
            .collect();
        for db in removed {
            info!("stop replication for {} (database removed from mysql)", db);
            if let Some(mut runner) = self.runners.remove(&db) {
                runner.stop().await;
            }
        }
        Ok(())
    }

    pub async fn run(&mut self) -> CResult<()> {
        let mut mysql_api = MySQLApi::new(None, &self.config.mysql);
        let databases: Vec<String> = mysql_api
            .get_databases()
            .await?
            .into_iter()
            .filter(|db| self.database_matches(db))
            .collect();
        info!("starting replication for databases: {:?}", databases);

        let killer = GracefulKiller::install();

        let mut binlog_runner =
            ProcessRunner::new(binlog_replicator_args(&self.config.settings_file));
        binlog_runner.run()?;
        self.binlog_runner = Some(binlog_runner);

        let mut db_optimizer =
            ProcessRunner::new(db_optimizer_args(&self.config.settings_file));
        db_optimizer.run()?;
        self.db_optimizer = Some(db_optimizer);

        let http_server = http::spawn_http_server(&self.config, Arc::clone(&self.restart_flags));

        let started = Instant::now();
        while started.elapsed() < DB_REPLICATOR_RUN_DELAY && !killer.kill_now() {
            sleep(Duration::from_millis(300)).await;
        }

        // first, resume databases whose initial replication already finished
        for db in &databases {
            if killer.kill_now() {
                break;
            }
            if !self.is_initial_replication_finished(db) {
                continue;
            }
            info!("running replication for {} (initial replication finished)", db);
            let mut runner =
                ProcessRunner::new(db_replicator_args(db, &self.config.settings_file));
            runner.run()?;
            self.runners.insert(db.clone(), runner);
        }

        // then the rest, one at a time, waiting for each snapshot
        for db in &databases {
            if self.runners.contains_key(db) || killer.kill_now() {
                continue;
            }
            info!(
                "running replication for {} (initial replication not finished - waiting)",
                db
            );
            let mut runner =
                ProcessRunner::new(db_replicator_args(db, &self.config.settings_file));
            runner.run()?;
            self.runners.insert(db.clone(), runner);
            if !self.wait_initial_replication {
                continue;
            }
            while !self.is_initial_replication_finished(db) && !killer.kill_now() {
                sleep(Duration::from_secs(1)).await;
                self.restart_dead_processes()?;
            }
        }

        info!("all replicators launched");

        let mut last_check_db_updated = Instant::now();
        while !killer.kill_now() {
            sleep(LIVENESS_INTERVAL).await;
            self.restart_replication_if_required().await?;
            self.restart_dead_processes()?;
            if last_check_db_updated.elapsed()
                > Duration::from_secs(self.config.check_db_updated_interval)
            {
                self.check_databases_updated(&mut mysql_api).await?;
                last_check_db_updated = Instant::now();
            }
        }

        info!("stopping runner");
        if let Some(runner) = self.binlog_runner.as_mut() {
            info!("stopping binlog replication");
            runner.stop().await;
        }
        if let Some(runner) = self.db_optimizer.as_mut() {
            info!("stopping db_optimizer");
            runner.stop().await;
        }
        for (db_name, runner) in self.runners.iter_mut() {
            info!("stopping replication for {}", db_name);
            runner.stop().await;
        }
        if let Some(handle) = http_server {
            handle.stop();
        }
        info!("stopped");
        Ok(())
    }
}
