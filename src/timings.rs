use std::net::SocketAddr;
use std::time::Duration;

use tokio::time::Instant;

/// Lifecycle signal emitted while one attempt is in flight.
///
/// Transports report the connection-level events through an
/// [`AttemptProbe`](crate::transport::AttemptProbe). The engine itself
/// generates `Response` and `End`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptEvent {
    Socket { reused: bool, needs_lookup: bool },
    Lookup,
    Connect { remote: Option<SocketAddr> },
    SecureConnect,
    UploadProgress { transferred: u64, total: Option<u64> },
    UploadComplete,
    Response,
    End,
    Activity,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Phases {
    pub wait: Option<Duration>,
    pub dns: Option<Duration>,
    pub tcp: Option<Duration>,
    pub tls: Option<Duration>,
    pub request: Option<Duration>,
    pub first_byte: Option<Duration>,
    pub download: Option<Duration>,
    pub total: Option<Duration>,
}

/// Monotonic timestamps of one attempt plus the derived phase durations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    pub start: Instant,
    pub socket: Option<Instant>,
    pub lookup: Option<Instant>,
    pub connect: Option<Instant>,
    pub secure_connect: Option<Instant>,
    pub upload: Option<Instant>,
    pub response: Option<Instant>,
    pub end: Option<Instant>,
    pub error: Option<Instant>,
    pub abort: Option<Instant>,
    pub phases: Phases,
}

impl Timings {
    fn new(start: Instant) -> Self {
        Self {
            start,
            socket: None,
            lookup: None,
            connect: None,
            secure_connect: None,
            upload: None,
            response: None,
            end: None,
            error: None,
            abort: None,
            phases: Phases::default(),
        }
    }
}

fn between(from: Option<Instant>, to: Instant) -> Option<Duration> {
    from.map(|from| to.saturating_duration_since(from))
}

#[derive(Debug)]
pub struct TimingTracker {
    timings: Timings,
    secure: bool,
}

impl TimingTracker {
    pub fn start(at: Instant, secure: bool) -> Self {
        Self {
            timings: Timings::new(at),
            secure,
        }
    }

    pub fn observe(&mut self, event: &AttemptEvent, at: Instant) {
        match event {
            AttemptEvent::Socket { reused, .. } => self.socket(*reused, at),
            AttemptEvent::Lookup => self.lookup(at),
            AttemptEvent::Connect { .. } => self.connect(at),
            AttemptEvent::SecureConnect => self.secure_connect(at),
            AttemptEvent::UploadComplete => self.upload(at),
            AttemptEvent::Response => self.response(at),
            AttemptEvent::End => self.end(at),
            AttemptEvent::UploadProgress { .. } | AttemptEvent::Activity => {}
        }
    }

    fn socket(&mut self, reused: bool, at: Instant) {
        let timings = &mut self.timings;
        timings.socket = Some(at);
        timings.phases.wait = Some(at.saturating_duration_since(timings.start));
        if reused {
            timings.lookup = Some(at);
            timings.connect = Some(at);
            timings.phases.dns = Some(Duration::ZERO);
            timings.phases.tcp = Some(Duration::ZERO);
            if self.secure {
                timings.secure_connect = Some(at);
                timings.phases.tls = Some(Duration::ZERO);
            }
        }
    }

    fn lookup(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.lookup.is_some() {
            return;
        }
        timings.lookup = Some(at);
        timings.phases.dns = between(timings.socket, at);
    }

    fn connect(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.connect.is_some() {
            return;
        }
        timings.connect = Some(at);
        if timings.lookup.is_none() {
            timings.lookup = Some(at);
            timings.phases.dns = between(timings.socket, at);
        }
        timings.phases.tcp = between(timings.lookup, at);
    }

    fn secure_connect(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.secure_connect.is_some() {
            return;
        }
        timings.secure_connect = Some(at);
        timings.phases.tls = between(timings.connect, at);
    }

    fn upload(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.upload.is_some() {
            return;
        }
        timings.upload = Some(at);
        timings.phases.request = between(timings.secure_connect.or(timings.connect), at);
    }

    fn response(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.response.is_some() {
            return;
        }
        timings.response = Some(at);
        timings.phases.first_byte = between(timings.upload, at);
    }

    fn end(&mut self, at: Instant) {
        let timings = &mut self.timings;
        if timings.end.is_some() {
            return;
        }
        timings.end = Some(at);
        timings.phases.download = between(timings.response, at);
        self.settle_total(at);
    }

    pub fn error(&mut self, at: Instant) {
        if self.timings.error.is_none() {
            self.timings.error = Some(at);
        }
        self.settle_total(at);
    }

    pub fn abort(&mut self, at: Instant) {
        if self.timings.abort.is_none() {
            self.timings.abort = Some(at);
        }
        self.settle_total(at);
    }

    fn settle_total(&mut self, at: Instant) {
        if self.timings.phases.total.is_none() {
            self.timings.phases.total = Some(at.saturating_duration_since(self.timings.start));
        }
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{AttemptEvent, TimingTracker};

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn fresh_tls_connection_derives_every_phase() {
        let start = Instant::now();
        let mut tracker = TimingTracker::start(start, true);
        tracker.observe(
            &AttemptEvent::Socket {
                reused: false,
                needs_lookup: true,
            },
            start + ms(1),
        );
        tracker.observe(&AttemptEvent::Lookup, start + ms(4));
        tracker.observe(&AttemptEvent::Connect { remote: None }, start + ms(10));
        tracker.observe(&AttemptEvent::SecureConnect, start + ms(30));
        tracker.observe(&AttemptEvent::UploadComplete, start + ms(31));
        tracker.observe(&AttemptEvent::Response, start + ms(80));
        tracker.observe(&AttemptEvent::End, start + ms(100));

        let phases = tracker.timings().phases;
        assert_eq!(phases.wait, Some(ms(1)));
        assert_eq!(phases.dns, Some(ms(3)));
        assert_eq!(phases.tcp, Some(ms(6)));
        assert_eq!(phases.tls, Some(ms(20)));
        assert_eq!(phases.request, Some(ms(1)));
        assert_eq!(phases.first_byte, Some(ms(49)));
        assert_eq!(phases.download, Some(ms(20)));
        assert_eq!(phases.total, Some(ms(100)));
    }

    #[test]
    fn connect_without_lookup_backfills_lookup() {
        let start = Instant::now();
        let mut tracker = TimingTracker::start(start, false);
        tracker.observe(
            &AttemptEvent::Socket {
                reused: false,
                needs_lookup: false,
            },
            start,
        );
        tracker.observe(&AttemptEvent::Connect { remote: None }, start + ms(5));

        let timings = tracker.timings();
        assert_eq!(timings.lookup, timings.connect);
        assert_eq!(timings.phases.dns, Some(ms(5)));
        assert_eq!(timings.phases.tcp, Some(Duration::ZERO));
    }

    #[test]
    fn reused_socket_backfills_connection_timestamps() {
        let start = Instant::now();
        let mut tracker = TimingTracker::start(start, true);
        tracker.observe(
            &AttemptEvent::Socket {
                reused: true,
                needs_lookup: false,
            },
            start + ms(2),
        );
        let timings = tracker.timings();
        assert_eq!(timings.lookup, Some(start + ms(2)));
        assert_eq!(timings.connect, Some(start + ms(2)));
        assert_eq!(timings.secure_connect, Some(start + ms(2)));
        assert_eq!(timings.phases.dns, Some(Duration::ZERO));
        assert_eq!(timings.phases.tcp, Some(Duration::ZERO));
        assert_eq!(timings.phases.tls, Some(Duration::ZERO));
        assert_eq!(timings.phases.wait, Some(ms(2)));
    }

    #[test]
    fn reused_plain_socket_leaves_tls_unset() {
        let start = Instant::now();
        let mut tracker = TimingTracker::start(start, false);
        tracker.observe(
            &AttemptEvent::Socket {
                reused: true,
                needs_lookup: false,
            },
            start,
        );
        tracker.observe(&AttemptEvent::UploadComplete, start + ms(3));
        let phases = tracker.timings().phases;
        assert_eq!(phases.tcp, Some(Duration::ZERO));
        assert_eq!(phases.tls, None);
        assert_eq!(phases.request, Some(ms(3)));
    }

    #[test]
    fn total_is_set_once_by_first_terminal_event() {
        let start = Instant::now();
        let mut tracker = TimingTracker::start(start, false);
        tracker.error(start + ms(7));
        tracker.abort(start + ms(9));
        tracker.observe(&AttemptEvent::End, start + ms(12));
        assert_eq!(tracker.timings().phases.total, Some(ms(7)));
        assert_eq!(tracker.timings().abort, Some(start + ms(9)));
    }
}
