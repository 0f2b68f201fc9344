//! Thread lifecycle for one device.
//!
//! A [`Driver`] runs four threads against a shared [`Device`]: the receive
//! listener, the mining loop, the nonce worker and the control loop. They
//! coordinate through the device's protocol state alone; storing
//! [`MiningState::Shutdown`] stops all of them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::device::{Device, MiningState};
use crate::error::{Error, Result};
use crate::tracing::prelude::*;

pub struct Driver {
    device: Arc<Device>,
    control: Option<JoinHandle<Result<()>>>,
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl Driver {
    /// Spawns the device threads. If one cannot be spawned, the ones
    /// already running are stopped again.
    pub fn start(device: Arc<Device>) -> Result<Self> {
        info!(port = device.port(), "Starting device");
        let mut driver = Driver {
            device: device.clone(),
            control: None,
            workers: Vec::with_capacity(3),
        };

        let threads: [(&'static str, fn(&Device)); 3] = [
            ("listener", Device::run_listener),
            ("nonce", Device::run_nonce_worker),
            ("mining", Device::run_mining),
        ];
        for (name, run) in threads {
            let device = device.clone();
            match spawn(name, move || run(&device)) {
                Ok(handle) => driver.workers.push((name, handle)),
                Err(e) => {
                    driver.device.set_state(MiningState::Shutdown);
                    let _ = driver.join_workers();
                    return Err(e);
                }
            }
        }

        let control_device = device.clone();
        match spawn("control", move || control_device.run_control()) {
            Ok(handle) => driver.control = Some(handle),
            Err(e) => {
                driver.device.set_state(MiningState::Shutdown);
                let _ = driver.join_workers();
                return Err(e);
            }
        }
        Ok(driver)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Whether the control loop is still running.
    pub fn is_running(&self) -> bool {
        self.control
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Blocks until the device stops on its own, then powers the chain
    /// down. Returns why it stopped: a disabled port or a reopen request.
    pub fn wait(mut self) -> Result<()> {
        let control = self.join_control();
        self.device.set_state(MiningState::Shutdown);
        let workers = self.join_workers();
        self.device.power_down();
        info!(port = self.device.port(), "Device stopped");
        control.and(workers)
    }

    /// Powers the chain down, then stops every thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.device.power_down();
        self.device.set_state(MiningState::Shutdown);
        let control = self.join_control();
        let workers = self.join_workers();
        info!(port = self.device.port(), "Device stopped");
        control.and(workers)
    }

    fn join_control(&mut self) -> Result<()> {
        match self.control.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(Error::ThreadPanicked("control"))),
            None => Ok(()),
        }
    }

    fn join_workers(&mut self) -> Result<()> {
        let mut result = Ok(());
        for (name, handle) in self.workers.drain(..) {
            if handle.join().is_err() {
                error!(port = self.device.port(), thread = name, "Thread panicked");
                result = Err(Error::ThreadPanicked(name));
            }
        }
        result
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if self.control.is_some() || !self.workers.is_empty() {
            self.device.set_state(MiningState::Shutdown);
        }
    }
}

fn spawn<T, F>(name: &'static str, f: F) -> Result<JoinHandle<T>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|source| Error::Spawn { name, source })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::tests::fixture;

    #[test]
    fn should_stop_every_thread_on_shutdown() {
        let f = fixture();
        let driver = Driver::start(f.device.clone()).expect("start");
        thread::sleep(Duration::from_millis(50));
        assert!(driver.is_running());

        driver.shutdown().expect("shutdown");
        assert_eq!(f.device.state(), MiningState::Shutdown);
        // Power-down pulses the reset line once more.
        assert!(f.transport.resets().len() >= 3);
    }

    #[test]
    fn should_report_disabled_port_from_wait() {
        let f = fixture();
        for _ in 0..11 {
            f.registry.record_init("ttyTEST0");
        }

        let driver = Driver::start(f.device.clone()).expect("start");
        assert!(matches!(
            driver.wait(),
            Err(Error::PortDisabled { attempts: 12, .. })
        ));
        assert_eq!(f.device.state(), MiningState::Shutdown);
    }
}
