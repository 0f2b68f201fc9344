//! Read-only snapshot of a device, for whatever reports on the host.

use serde::Serialize;

use crate::device::chip::ChipRecord;
use crate::device::frequency::FrequencyState;
use crate::device::nonce::QueueStats;
use crate::device::pacing::SleepStats;
use crate::device::rates::{Rates, noncepercent};
use crate::device::ticket::TicketState;
use crate::device::{Counters, Device, LoopStats, MiningState, Timers};
use crate::stats::Timestamp;
use crate::stats::hashrate::RateSummary;
use crate::stats::jobs::JobSummary;

#[derive(Debug, Clone, Serialize)]
pub struct ChipTelemetry {
    pub index: usize,
    pub address: u8,
    #[serde(flatten)]
    pub record: ChipRecord,
    /// Nonces per chip-ring bucket, newest first.
    pub nonce_ranges: Vec<u64>,
    /// Observed against expected nonces over the chip ring, in percent.
    pub noncepercent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    pub port: String,
    pub state: MiningState,
    pub elapsed_secs: f64,
    pub boosting: bool,
    pub midstates: usize,
    pub usb_prop_us: u32,
    pub counters: Counters,
    pub timers: Timers,
    pub frequency: FrequencyState,
    pub ticket: TicketState,
    pub rates: Rates,
    pub loop_stats: LoopStats,
    pub chips: Vec<ChipTelemetry>,
    pub hashrate: RateSummary,
    pub jobs: Vec<JobSummary>,
    /// Seconds since the job ring last saw a task.
    pub job_data_age_secs: Option<f64>,
    pub sleep: SleepStats,
    pub nonce_queue: QueueStats,
}

impl Device {
    pub fn telemetry(&self) -> Telemetry {
        let now = Timestamp::now();
        let cores = self.family.cores();

        let inner = self.inner.lock();
        let records = inner.chips.clone();
        let counters = inner.counters.clone();
        let timers = inner.timers.clone();
        let frequency = inner.freq.clone();
        let ticket = inner.ticket.clone();
        let rates = inner.rates.clone();
        let loop_stats = inner.loop_stats.clone();
        let midstates = inner.midstates;
        let boosting = inner.boosting(self.config.noboost);
        drop(inner);

        let chip_count = records.len();
        let mut hashrate = self.hashrate.lock();
        let chips = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| {
                let nonces = hashrate.chip_nonces(index, now);
                ChipTelemetry {
                    index,
                    address: self.family.chip_address(index, chip_count),
                    noncepercent: noncepercent(
                        &record,
                        nonces,
                        cores,
                        rates.hr_scale,
                        ticket.difficulty,
                        now,
                    ),
                    nonce_ranges: hashrate.chip_ranges(index),
                    record,
                }
            })
            .collect();
        let hashrate_summary = hashrate.summary(now);
        drop(hashrate);

        let (jobs, job_data_age_secs) = {
            let jobs = self.jobs.lock();
            (jobs.summary(), jobs.data_age_secs(now))
        };

        Telemetry {
            port: self.port().to_string(),
            state: self.state(),
            elapsed_secs: now.secs_since(timers.start_time),
            boosting,
            midstates,
            usb_prop_us: self.usb_prop_us(),
            counters,
            timers,
            frequency,
            ticket,
            rates,
            loop_stats,
            chips,
            hashrate: hashrate_summary,
            jobs,
            job_data_age_secs,
            sleep: self.pacer.snapshot(),
            nonce_queue: self.nonces.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{fixture, with_chips};

    #[test]
    fn should_snapshot_fresh_device() {
        let f = fixture();
        let telemetry = f.device.telemetry();
        assert_eq!(telemetry.state, MiningState::Init);
        assert!(telemetry.chips.is_empty());
        assert_eq!(telemetry.counters.nonces, 0);
        assert_eq!(telemetry.usb_prop_us, 200);
    }

    #[test]
    fn should_address_every_chip() {
        let f = fixture();
        with_chips(&f.device, 2);
        let telemetry = f.device.telemetry();
        let addresses: Vec<u8> = telemetry.chips.iter().map(|chip| chip.address).collect();
        assert_eq!(addresses, vec![0x00, 0x80]);
        assert!(telemetry.chips.iter().all(|chip| chip.nonce_ranges.len() <= 6));
    }

    #[test]
    fn should_serialize_as_json() {
        let f = fixture();
        with_chips(&f.device, 1);
        let json = serde_json::to_value(f.device.telemetry()).expect("json");
        assert_eq!(json["state"], "INIT");
        assert_eq!(json["chips"][0]["index"], 0);
        assert!(json["chips"][0]["frequency"].is_number());
        assert!(json["hashrate"]["ghs"].is_number());
        assert!(json["nonce_queue"]["dropped"].is_number());
    }
}
