//! A level-triggered multiplexer over a set of [`Channel`]s, backed
//! directly by `poll(2)`. See spec §4.2 for the dense-vector/sparse-map
//! design and the disabled-slot trick.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

use crate::channel::{Channel, Events};
use crate::timestamp::Timestamp;

/// Channels are identified by a stable integer handed out by whoever
/// registers them (the `EventLoop`); the Poller never looks inside a
/// `Channel` beyond its fd and event mask.
pub type ChannelId = u64;

struct Entry {
    fd: RawFd,
    events: Events,
}

/// Dense pollfd-shaped vector plus a sparse fd→slot map, exactly spec
/// §4.2's structure: O(1) update via the stored index, O(1) removal via
/// swap-with-last.
pub struct Poller {
    fds: Vec<libc::pollfd>,
    entries: Vec<Entry>,
    ids: Vec<ChannelId>,
    index_of: HashMap<ChannelId, usize>,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller {
    pub fn new() -> Poller {
        Poller {
            fds: Vec::new(),
            entries: Vec::new(),
            ids: Vec::new(),
            index_of: HashMap::new(),
        }
    }

    /// Inserts or updates the registration for `id`. Returns the slot
    /// index, which the caller should stash on the owning `Channel`.
    pub fn update_channel(&mut self, id: ChannelId, fd: RawFd, events: Events) -> i32 {
        match self.index_of.get(&id).copied() {
            Some(idx) => {
                self.entries[idx].events = events;
                self.fds[idx].events = events.bits();
                self.fds[idx].fd = if events == Events::NONE { -fd - 1 } else { fd };
                idx as i32
            }
            None => {
                let idx = self.fds.len();
                self.fds.push(libc::pollfd {
                    fd: if events == Events::NONE { -fd - 1 } else { fd },
                    events: events.bits(),
                    revents: 0,
                });
                self.entries.push(Entry { fd, events });
                self.ids.push(id);
                self.index_of.insert(id, idx);
                idx as i32
            }
        }
    }

    /// Erases the registration for `id` entirely (as opposed to merely
    /// disabling it). Uses swap-with-last so removal stays O(1); the
    /// caller must re-stash the moved channel's new index.
    pub fn remove_channel(&mut self, id: ChannelId) -> Option<(ChannelId, i32)> {
        let idx = self.index_of.remove(&id)?;
        let last = self.fds.len() - 1;

        self.fds.swap_remove(idx);
        self.entries.swap_remove(idx);
        self.ids.swap_remove(idx);

        if idx != last {
            let moved_id = self.ids[idx];
            self.index_of.insert(moved_id, idx);
            return Some((moved_id, idx as i32));
        }
        None
    }

    /// Blocks in `poll(2)` for up to `timeout_ms` (negative = forever),
    /// then returns the wake time and the ids of channels with non-zero
    /// `revents`, in dense-vector order, alongside each channel's
    /// `revents` translated back into [`Events`].
    pub fn poll(
        &mut self,
        timeout_ms: i32,
    ) -> io::Result<(Timestamp, Vec<(ChannelId, Events)>)> {
        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };

        let now = Timestamp::now();

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok((now, Vec::new()));
            }
            return Err(err);
        }

        let mut active = Vec::with_capacity(n as usize);
        let mut found = 0;
        for (i, pfd) in self.fds.iter().enumerate() {
            if found >= n {
                break;
            }
            if pfd.revents != 0 {
                found += 1;
                active.push((self.ids[i], Events::from_bits_truncate(pfd.revents)));
            }
        }

        Ok((now, active))
    }

    pub fn has_channel(&self, id: ChannelId) -> bool {
        self.index_of.contains_key(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn register_then_poll_sees_readable_pipe() {
        let (mut reader, mut writer) = make_pipe();
        let mut poller = Poller::new();
        poller.update_channel(1, reader.as_raw_fd(), Events::READABLE);

        use std::io::Write;
        writer.write_all(b"x").unwrap();

        let (_now, active) = poller.poll(1000).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, 1);
        assert!(active[0].1.contains(Events::READABLE));

        use std::io::Read;
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf).unwrap();
    }

    #[test]
    fn disabling_events_masks_the_slot_but_keeps_the_mapping() {
        let (reader, _writer) = make_pipe();
        let mut poller = Poller::new();
        let id = 7;
        poller.update_channel(id, reader.as_raw_fd(), Events::READABLE);
        poller.update_channel(id, reader.as_raw_fd(), Events::NONE);
        assert!(poller.has_channel(id));
        assert_eq!(poller.fds[0].fd, -(reader.as_raw_fd()) - 1);
    }

    #[test]
    fn remove_swaps_with_last() {
        let (a, _wa) = make_pipe();
        let (b, _wb) = make_pipe();
        let mut poller = Poller::new();
        poller.update_channel(1, a.as_raw_fd(), Events::READABLE);
        poller.update_channel(2, b.as_raw_fd(), Events::READABLE);
        poller.remove_channel(1);
        assert!(!poller.has_channel(1));
        assert!(poller.has_channel(2));
        assert_eq!(poller.index_of[&2], 0);
    }

    fn make_pipe() -> (std::fs::File, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0i32; 2];
        unsafe { libc::pipe(fds.as_mut_ptr()) };
        unsafe {
            (
                std::fs::File::from_raw_fd(fds[0]),
                std::fs::File::from_raw_fd(fds[1]),
            )
        }
    }
}
