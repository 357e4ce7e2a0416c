//! The module that implements the `forkvm bench` command.

use anyhow::{Result, bail};
use clap::Parser;
use forkvm::{CallResult, TenantConfig, TenantInstance, page_pool};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Drives requests against configured tenants from several threads
#[derive(Parser)]
pub struct BenchCommand {
    /// The TOML file describing the tenants
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Number of worker threads per tenant
    #[arg(long, value_name = "N", default_value_t = 1)]
    threads: usize,

    /// Number of requests each worker makes
    #[arg(long, value_name = "N", default_value_t = 1000)]
    iterations: u64,

    /// The function each request calls
    #[arg(long, value_name = "FUNCTION", default_value = "on_client_request")]
    invoke: String,

    /// The most result buffers to gather per request
    #[arg(long, value_name = "N", default_value_t = 64)]
    buffers: usize,

    /// Pages each worker puts in its pool before it starts
    #[arg(long, value_name = "N", default_value_t = 0)]
    reserve_pages: usize,
}

/// Outcomes of one worker's requests.
#[derive(Default, Clone, Copy)]
struct Tally {
    ok: u64,
    timeouts: u64,
    faults: u64,
    bytes: u64,
}

impl Tally {
    fn merge(mut self, other: Tally) -> Tally {
        self.ok += other.ok;
        self.timeouts += other.timeouts;
        self.faults += other.faults;
        self.bytes += other.bytes;
        self
    }
}

impl BenchCommand {
    /// Executes the command.
    pub fn execute(self) -> Result<()> {
        crate::init_logging();

        let configs = TenantConfig::from_file(&self.config)?;
        if configs.is_empty() {
            bail!("no tenants in {}", self.config.display());
        }
        for config in configs {
            let tenant = TenantInstance::try_new(config)?;
            let address = tenant.lookup(&self.invoke);
            if address == 0 {
                bail!(
                    "tenant `{}` has no function `{}`",
                    tenant.config().name,
                    self.invoke
                );
            }
            let (tally, elapsed) = self.drive(&tenant, address)?;
            self.report(&tenant, tally, elapsed);
        }
        Ok(())
    }

    fn drive(&self, tenant: &TenantInstance, address: u64) -> Result<(Tally, Duration)> {
        let start = Instant::now();
        let tally = thread::scope(|s| {
            let workers: Vec<_> = (0..self.threads.max(1))
                .map(|_| s.spawn(move || self.worker(tenant, address)))
                .collect();
            workers.into_iter().try_fold(Tally::default(), |acc, w| {
                match w.join() {
                    Ok(tally) => Ok(acc.merge(tally?)),
                    Err(_) => bail!("worker thread panicked"),
                }
            })
        })?;
        Ok((tally, start.elapsed()))
    }

    fn worker(&self, tenant: &TenantInstance, address: u64) -> Result<Tally> {
        page_pool::reserve_pages(self.reserve_pages);
        let mut tally = Tally::default();
        for _ in 0..self.iterations {
            let call = tenant.forkcall(address, self.buffers)?;
            match call.result() {
                CallResult::Returned(_) => tally.ok += 1,
                CallResult::Timeout => tally.timeouts += 1,
                CallResult::Fault(_) => tally.faults += 1,
            }
            tally.bytes += call.buffers().map(|b| b.len() as u64).sum::<u64>();
        }
        Ok(tally)
    }

    fn report(&self, tenant: &TenantInstance, tally: Tally, elapsed: Duration) {
        let total = tally.ok + tally.timeouts + tally.faults;
        let rate = total as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        println!(
            "{}: {total} requests on {} threads in {elapsed:.2?} ({rate:.0}/s): \
             {} ok, {} timeouts, {} faults, {} bytes gathered",
            tenant.config().name,
            self.threads.max(1),
            tally.ok,
            tally.timeouts,
            tally.faults,
            tally.bytes,
        );
    }
}
