//! Coherence statistics collection and reporting.
//!
//! This module tracks what the coherence subsystem did during a run. It provides:
//! 1. **Controller counters:** MAF allocations and merges, victims by disposition,
//!    IOWB traffic, probes by outcome, anomalies, and backpressure events.
//! 2. **Hub counters:** Requests routed, probes sent, skid-buffer parks, and memory traffic.
//! 3. **Reporting:** Section-selectable text output in the style of a simulator summary.

use std::ops::AddAssign;
use std::time::Instant;

use serde::Serialize;

/// Counters kept by one CPU's coherence controller.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoherenceStats {
    /// MAF entries allocated.
    pub maf_allocations: u64,
    /// Misses folded into a live MAF entry.
    pub maf_merges: u64,
    /// References satisfied from the local caches without a hub request.
    pub local_hits: u64,
    /// Primary-cache victims written into the backup cache.
    pub victims_to_bcache: u64,
    /// Backup-cache victims written back to memory.
    pub victims_to_memory: u64,
    /// Dirty blocks returned for probes.
    pub victims_probe: u64,
    /// IOWB entries allocated.
    pub iowb_allocations: u64,
    /// I/O stores merged into an existing IOWB entry.
    pub iowb_merges: u64,
    /// Probes that found the line.
    pub probe_hits: u64,
    /// Probes that missed.
    pub probe_misses: u64,
    /// Probes carrying a reserved next-state code.
    pub anomalies: u64,
    /// Requests refused because a buffer was full.
    pub backpressure: u64,
    /// Completions received from the hub.
    pub completions: u64,
}

impl AddAssign for CoherenceStats {
    fn add_assign(&mut self, rhs: Self) {
        self.maf_allocations += rhs.maf_allocations;
        self.maf_merges += rhs.maf_merges;
        self.local_hits += rhs.local_hits;
        self.victims_to_bcache += rhs.victims_to_bcache;
        self.victims_to_memory += rhs.victims_to_memory;
        self.victims_probe += rhs.victims_probe;
        self.iowb_allocations += rhs.iowb_allocations;
        self.iowb_merges += rhs.iowb_merges;
        self.probe_hits += rhs.probe_hits;
        self.probe_misses += rhs.probe_misses;
        self.anomalies += rhs.anomalies;
        self.backpressure += rhs.backpressure;
        self.completions += rhs.completions;
    }
}

/// Counters kept by the coherence hub.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    /// Requests pulled from CPU queues.
    pub requests: u64,
    /// Read transactions opened.
    pub transactions: u64,
    /// Probes sent to CPUs.
    pub probes_sent: u64,
    /// Probe responses received.
    pub probe_responses: u64,
    /// Responses that carried dirty data.
    pub dirty_responses: u64,
    /// Probes parked in the skid buffer because a ring was full.
    pub skid_parks: u64,
    /// Blocks read from memory.
    pub memory_reads: u64,
    /// Blocks written to memory.
    pub memory_writes: u64,
    /// I/O-space writes accepted.
    pub io_writes: u64,
    /// Requests that hit no memory array.
    pub nonexistent: u64,
}

/// Statistics for a whole run.
#[derive(Clone, Debug, Serialize)]
pub struct SystemStats {
    #[serde(skip)]
    start_time: Instant,
    /// One entry per CPU, in CPU order.
    pub cpus: Vec<CoherenceStats>,
    /// Hub counters.
    pub hub: HubStats,
}

impl Default for SystemStats {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            cpus: Vec::new(),
            hub: HubStats::default(),
        }
    }
}

/// Section names for selective stats output.
///
/// Valid section identifiers: `"summary"`, `"cpu"`, `"hub"`.
/// Pass an empty slice to `print_sections` to print all sections.
pub const STATS_SECTIONS: &[&str] = &["summary", "cpu", "hub"];

impl SystemStats {
    /// Creates an empty record stamped with the current time.
    pub fn new(cpus: Vec<CoherenceStats>, hub: HubStats) -> Self {
        Self {
            start_time: Instant::now(),
            cpus,
            hub,
        }
    }

    /// Sum of every CPU's counters.
    pub fn total(&self) -> CoherenceStats {
        let mut total = CoherenceStats::default();
        for cpu in &self.cpus {
            total += *cpu;
        }
        total
    }

    /// Prints only the requested statistics sections to stdout.
    ///
    /// # Arguments
    ///
    /// * `sections` - Slice of section names to print, or empty for all.
    pub fn print_sections(&self, sections: &[String]) {
        let want = |s: &str| sections.is_empty() || sections.iter().any(|x| x == s);
        let seconds = self.start_time.elapsed().as_secs_f64();
        let total = self.total();

        if want("summary") {
            println!("\n==========================================================");
            println!("COHERENCE SUBSYSTEM STATISTICS");
            println!("==========================================================");
            println!("host_seconds             {seconds:.4} s");
            println!("cpus                     {}", self.cpus.len());
            println!("maf.allocations          {}", total.maf_allocations);
            println!("maf.merges               {}", total.maf_merges);
            println!("local_hits               {}", total.local_hits);
            println!("anomalies                {}", total.anomalies);
            println!("backpressure             {}", total.backpressure);
            println!("----------------------------------------------------------");
        }
        if want("cpu") {
            for (i, cpu) in self.cpus.iter().enumerate() {
                let probes = cpu.probe_hits + cpu.probe_misses;
                let hit_rate = if probes > 0 {
                    100.0 * (cpu.probe_hits as f64 / probes as f64)
                } else {
                    0.0
                };
                println!("CPU {i}");
                println!(
                    "  maf                    alloc: {:<8} merge: {:<8} hits: {}",
                    cpu.maf_allocations, cpu.maf_merges, cpu.local_hits
                );
                println!(
                    "  victims                bcache: {:<7} memory: {:<7} probe: {}",
                    cpu.victims_to_bcache, cpu.victims_to_memory, cpu.victims_probe
                );
                println!(
                    "  iowb                   alloc: {:<8} merge: {}",
                    cpu.iowb_allocations, cpu.iowb_merges
                );
                println!(
                    "  probes                 {probes:<10} hit_rate: {hit_rate:.2}%"
                );
            }
            println!("----------------------------------------------------------");
        }
        if want("hub") {
            let h = &self.hub;
            println!("HUB");
            println!("  requests               {}", h.requests);
            println!("  transactions           {}", h.transactions);
            println!("  probes.sent            {}", h.probes_sent);
            println!("  probes.dirty           {}", h.dirty_responses);
            println!("  skid.parks             {}", h.skid_parks);
            println!("  mem.reads              {}", h.memory_reads);
            println!("  mem.writes             {}", h.memory_writes);
            println!("  io.writes              {}", h.io_writes);
            println!("  nxm                    {}", h.nonexistent);
        }
        println!("==========================================================");
    }

    /// Prints all statistics sections to stdout.
    ///
    /// Equivalent to `print_sections(&[])`.
    pub fn print(&self) {
        self.print_sections(&[]);
    }
}
