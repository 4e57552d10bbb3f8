//! Multiplexes device fds, the hotplug monitor and the IPC socket through
//! one mio poll, with engine deadlines as the poll timeout.

use crate::device::{Device, Devmon, MAX_DEVICES};
use log::warn;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

const TOKEN_DEVMON: Token = Token(usize::MAX - 1);
const TOKEN_AUX: Token = Token(usize::MAX - 2);

/// One poll round: the wall clock in loop-relative ms plus what woke us.
pub struct Wake {
    pub now: i64,
    pub aux: bool,
    pub hotplug: bool,
    pub devices: Vec<usize>,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    devmon: Devmon,
    aux_fd: RawFd,
    /// Stable device slots; tokens index into this table.
    pub devices: Vec<Option<Device>>,
    start: Instant,
}

impl EventLoop {
    pub fn new(aux_fd: RawFd) -> io::Result<EventLoop> {
        let poll = Poll::new()?;
        let devmon = Devmon::create()?;

        poll.registry()
            .register(&mut SourceFd(&devmon.fd()), TOKEN_DEVMON, Interest::READABLE)?;
        poll.registry()
            .register(&mut SourceFd(&aux_fd), TOKEN_AUX, Interest::READABLE)?;

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(32),
            devmon,
            aux_fd,
            devices: Vec::new(),
            start: Instant::now(),
        })
    }

    pub fn now_ms(&self) -> i64 {
        self.start.elapsed().as_millis() as i64
    }

    /// Inserts a device into a free slot. Interest is registered once the
    /// daemon decides whether the device is grabbed.
    pub fn add_device(&mut self, dev: Device) -> Option<usize> {
        let slot = match self.devices.iter().position(Option::is_none) {
            Some(slot) => slot,
            None => {
                if self.devices.len() >= MAX_DEVICES {
                    warn!("too many devices, ignoring {}", dev.name);
                    return None;
                }
                self.devices.push(None);
                self.devices.len() - 1
            }
        };

        self.devices[slot] = Some(dev);
        Some(slot)
    }

    pub fn remove_device(&mut self, slot: usize) -> Option<Device> {
        let dev = self.devices.get_mut(slot)?.take()?;
        let _ = self.poll.registry().deregister(&mut SourceFd(&dev.fd()));
        Some(dev)
    }

    /// Polls a device only while its events are ours to consume: grabbed
    /// devices, and our own virtual devices for LED echo.
    pub fn update_interest(&mut self, slot: usize) {
        let Some(Some(dev)) = self.devices.get(slot) else {
            return;
        };

        let fd = dev.fd();
        // Grabbed devices are ours to drain; the virtual keyboard is
        // watched for LED state written back by the host.
        let wanted =
            dev.grabbed || (dev.is_virtual && dev.capabilities & crate::config::CAP_KEYBOARD != 0);

        // mio tolerates re-registration only after deregister; failure of
        // either call just means the fd was not in the expected state.
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        if wanted {
            if let Err(e) =
                self.poll
                    .registry()
                    .register(&mut SourceFd(&fd), Token(slot), Interest::READABLE)
            {
                warn!("failed to register device fd: {e}");
            }
        }
    }

    pub fn read_new_devices(&self) -> Vec<Device> {
        self.devmon.read_devices()
    }

    /// Blocks until activity or `timeout_ms` (0 = no deadline).
    pub fn wait(&mut self, timeout_ms: i64) -> io::Result<Wake> {
        let timeout = if timeout_ms > 0 {
            Some(std::time::Duration::from_millis(timeout_ms as u64))
        } else {
            None
        };

        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let mut wake = Wake {
            now: self.now_ms(),
            aux: false,
            hotplug: false,
            devices: Vec::new(),
        };

        for event in self.events.iter() {
            match event.token() {
                TOKEN_DEVMON => wake.hotplug = true,
                TOKEN_AUX => wake.aux = true,
                Token(slot) => {
                    if self.devices.get(slot).is_some_and(Option::is_some) {
                        wake.devices.push(slot);
                    }
                }
            }
        }

        // Highest slots first so removal-driven compaction stays valid.
        wake.devices.sort_unstable_by(|a, b| b.cmp(a));

        Ok(wake)
    }

    pub fn aux_fd(&self) -> RawFd {
        self.aux_fd
    }
}
