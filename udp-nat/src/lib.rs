//! UDP NAT map (§4.9): a sharded, idle-evicted table from `(source addr,
//! source port)` to a per-source pseudo-connection, so stateless UDP flows
//! can be driven through the rest of this workspace as `Conn`-like sessions.
//! Grounded on `original_source/netio/udpnat/new.go` (`UdpNat`, `PrepareFunc`)
//! and `udpnat/conn.go` (`natConn`, `PacketHandler`).

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use net_address::Endpoint;
use net_descriptor::{BoxFuture, PacketConn as NdPacketConn};
use parking_lot::Mutex;
use tokio::sync::Notify;

/// §6 default capacity.
pub const DEFAULT_CAPACITY: u32 = 1024;
/// §6 default UDP keepalive / NAT entry lifetime.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// §3 default per-conn packet queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("nat conn is closed")]
    Closed,
    #[error("read deadline exceeded")]
    DeadlineExceeded,
    #[error("invalid argument: this nat conn has no write deadline")]
    InvalidArgument,
}

/// Writes an outbound packet on behalf of a NAT entry, e.g. the socket the
/// entry's first packet arrived on. Supplied by [`Prepare::prepare`].
pub trait PacketWriter: Send + Sync {
    fn write_to<'a>(&'a self, buf: &'a [u8], dst: SocketAddr) -> BoxFuture<'a, std::io::Result<usize>>;
}

/// Receives packets for a NAT entry directly, bypassing its queue. Installed
/// with [`Conn::set_handler`].
pub trait PacketHandler: Send + Sync {
    fn on_packet(&self, packet: Bytes);
}

/// What [`Prepare::prepare`] hands back for a newly-observed source.
pub struct PrepareResult {
    pub writer: Arc<dyn PacketWriter>,
    pub handler: Option<Arc<dyn PacketHandler>>,
    pub on_close: Option<Box<dyn FnOnce() + Send>>,
}

/// Decides whether a never-seen-before `(source, destination)` pair gets a
/// NAT entry at all. Returning `None` declines — no entry is created and the
/// first packet is dropped, per §4.9 `NewPacket`.
pub trait Prepare: Send + Sync {
    fn prepare(&self, source: SocketAddr, destination: SocketAddr, first_packet: &[u8]) -> Option<PrepareResult>;
}

impl<F> Prepare for F
where
    F: Fn(SocketAddr, SocketAddr, &[u8]) -> Option<PrepareResult> + Send + Sync,
{
    fn prepare(&self, source: SocketAddr, destination: SocketAddr, first_packet: &[u8]) -> Option<PrepareResult> {
        self(source, destination, first_packet)
    }
}

/// Either a bounded FIFO queue or an installed handler — never both at once
/// (§3 NAT entry invariant). Guarded by one lock so `set_handler`'s drain and
/// a concurrent `deliver` never interleave.
struct Delivery {
    handler: Option<Arc<dyn PacketHandler>>,
    queue: VecDeque<Bytes>,
    capacity: usize,
}

impl Delivery {
    fn new(capacity: usize) -> Self {
        Self { handler: None, queue: VecDeque::new(), capacity }
    }
}

struct Entry {
    source: SocketAddr,
    destination: SocketAddr,
    writer: Arc<dyn PacketWriter>,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    closed: AtomicBool,
    close_notify: Notify,
    delivery: Mutex<Delivery>,
    packet_ready: Notify,
    read_deadline: Mutex<Option<Instant>>,
}

impl Entry {
    fn new(source: SocketAddr, destination: SocketAddr, writer: Arc<dyn PacketWriter>, on_close: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self {
            source,
            destination,
            writer,
            on_close: Mutex::new(on_close),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            delivery: Mutex::new(Delivery::new(DEFAULT_QUEUE_CAPACITY)),
            packet_ready: Notify::new(),
            read_deadline: Mutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delivers one packet: synchronously to the installed handler, or into
    /// the bounded queue — dropped (and its buffer released) when full.
    fn deliver(&self, packet: Bytes) {
        let handler = {
            let mut delivery = self.delivery.lock();
            match &delivery.handler {
                Some(h) => Some(h.clone()),
                None => {
                    if delivery.queue.len() >= delivery.capacity {
                        tracing::trace!(source = %self.source, "nat packet queue full, dropping packet");
                        None
                    } else {
                        delivery.queue.push_back(packet.clone());
                        None
                    }
                }
            }
        };

        match handler {
            Some(h) => h.on_packet(packet),
            None => self.packet_ready.notify_one(),
        }
    }

    /// Swaps in `handler` and drains whatever is already queued into it, in
    /// order, before releasing the lock — so no packet queued-before-install
    /// is ever missed, and every packet after is delivered directly (§8,
    /// scenario 6).
    fn set_handler(&self, handler: Arc<dyn PacketHandler>) {
        let drained: Vec<Bytes> = {
            let mut delivery = self.delivery.lock();
            delivery.handler = Some(handler.clone());
            delivery.queue.drain(..).collect()
        };
        for packet in drained {
            handler.on_packet(packet);
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.close_notify.notify_waiters();
        self.packet_ready.notify_waiters();
        if let Some(on_close) = self.on_close.lock().take() {
            on_close();
        }
    }
}

/// A per-source pseudo-connection handed back by [`NatMap::new_packet`].
/// Cheap to clone: all clones share the same underlying entry.
#[derive(Clone)]
pub struct Conn(Arc<Entry>);

impl Conn {
    pub fn source(&self) -> SocketAddr {
        self.0.source
    }

    pub fn destination(&self) -> SocketAddr {
        self.0.destination
    }

    /// Installs `handler`, draining any already-queued packets into it first.
    pub fn set_handler(&self, handler: Arc<dyn PacketHandler>) {
        self.0.set_handler(handler);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.0.read_deadline.lock() = deadline;
    }

    /// Always fails: UDP has no send deadline in this model (§4.9 `Conn` surface).
    pub fn set_deadline(&self) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    /// Always fails: UDP has no send deadline in this model (§4.9 `Conn` surface).
    pub fn set_write_deadline(&self) -> Result<(), Error> {
        Err(Error::InvalidArgument)
    }

    /// Drains one packet from the queue, or waits for one to arrive, honoring
    /// the read deadline. Fails once the conn is closed.
    pub async fn read(&self) -> Result<Bytes, Error> {
        loop {
            if let Some(packet) = self.try_pop() {
                return Ok(packet);
            }
            if self.0.is_closed() {
                return Err(Error::Closed);
            }

            let ready = self.0.packet_ready.notified();
            let closed = self.0.close_notify.notified();
            tokio::pin!(ready, closed);

            // Re-check after constructing the notified futures (avoids
            // missing a wakeup that landed between the first check and here).
            if let Some(packet) = self.try_pop() {
                return Ok(packet);
            }
            if self.0.is_closed() {
                return Err(Error::Closed);
            }

            match *self.0.read_deadline.lock() {
                Some(deadline) if deadline <= Instant::now() => return Err(Error::DeadlineExceeded),
                Some(deadline) => {
                    tokio::select! {
                        _ = ready => {}
                        _ = closed => {}
                        _ = tokio::time::sleep_until(deadline.into()) => return Err(Error::DeadlineExceeded),
                    }
                }
                None => {
                    tokio::select! {
                        _ = ready => {}
                        _ = closed => {}
                    }
                }
            }
        }
    }

    fn try_pop(&self) -> Option<Bytes> {
        let mut delivery = self.0.delivery.lock();
        if delivery.handler.is_some() {
            return None;
        }
        delivery.queue.pop_front()
    }

    /// `ReadFrom(p) = (Read(p), source_addr)` per §4.9.
    pub async fn read_from(&self) -> Result<(Bytes, SocketAddr), Error> {
        let packet = self.read().await?;
        Ok((packet, self.0.source))
    }

    pub async fn write(&self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.writer.write_to(buf, self.0.source).await
    }

    pub async fn write_to(&self, buf: &[u8], dst: SocketAddr) -> std::io::Result<usize> {
        self.0.writer.write_to(buf, dst).await
    }

    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

fn shard_count() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1).next_power_of_two().min(16)
}

/// Sharded LRU of `(source, destination)` → [`Conn`], lifetime-evicted per
/// §4.9. Each shard stores its own expiry per entry (the Rust analogue of
/// `freelru.NewSharded` + `SetLifetime`/`GetAndRefresh`).
pub struct NatMap {
    shards: Vec<Mutex<LruCache<SocketAddr, Slot>>>,
    prepare: Arc<dyn Prepare>,
    timeout: Duration,
}

struct Slot {
    conn: Conn,
    expiry: Instant,
}

impl NatMap {
    pub fn new(prepare: Arc<dyn Prepare>, capacity: u32, timeout: Duration) -> Self {
        let shard_count = shard_count();
        let per_shard = NonZeroUsize::new((capacity as usize).max(shard_count) / shard_count).unwrap_or(NonZeroUsize::MIN);
        let shards = (0..shard_count).map(|_| Mutex::new(LruCache::new(per_shard))).collect();

        Self { shards, prepare, timeout }
    }

    fn shard_for(&self, source: SocketAddr) -> &Mutex<LruCache<SocketAddr, Slot>> {
        // `SocketAddr`'s `Hash` impl is good enough to spread sources evenly
        // across shards; no separate hash seed is needed here (unlike the
        // cache/single-flight keys, which are structurally richer).
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        source.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// §4.9 `NewPacket`: refreshes (and delivers to) a live entry for
    /// `source`, or asks [`Prepare`] to create one. Returns `None` when
    /// `Prepare` declines for a never-seen source — no entry is created and
    /// `buf` is dropped without being delivered anywhere.
    pub fn new_packet(&self, buf: &[u8], source: SocketAddr, destination: SocketAddr) -> Option<(Conn, bool)> {
        let now = Instant::now();
        let shard = self.shard_for(source);

        {
            let mut guard = shard.lock();
            if let Some(slot) = guard.get_mut(&source) {
                if !slot.conn.is_closed() && slot.expiry > now {
                    slot.expiry = now + self.timeout;
                    let conn = slot.conn.clone();
                    drop(guard);
                    conn.0.deliver(Bytes::copy_from_slice(buf));
                    return Some((conn, false));
                }
                let stale = guard.pop(&source);
                drop(guard);
                // An idle-expired entry is treated as absent: close it (firing
                // `on_close`) before falling through to create a fresh one.
                if let Some(stale) = stale {
                    stale.conn.close();
                }
            }
        }

        let prepared = self.prepare.prepare(source, destination, buf)?;
        let entry = Arc::new(Entry::new(source, destination, prepared.writer, prepared.on_close));
        let conn = Conn(entry);
        if let Some(handler) = prepared.handler {
            conn.set_handler(handler);
        }

        {
            let mut guard = shard.lock();
            if let Some((evicted_source, evicted)) = guard.push(source, Slot { conn: conn.clone(), expiry: now + self.timeout }) {
                if evicted_source != source {
                    evicted.conn.close();
                }
            }
        }

        conn.0.deliver(Bytes::copy_from_slice(buf));
        Some((conn, true))
    }

    /// Closes every live entry; called on shutdown.
    pub fn close(&self) {
        for shard in &self.shards {
            let mut guard = shard.lock();
            for (_, slot) in guard.iter() {
                slot.conn.close();
            }
            guard.clear();
        }
    }
}

/// Adapts a resolved [`NdPacketConn`] so callers can keep addressing it by a
/// symbolic endpoint (possibly an FQDN) while the underlying socket only
/// speaks concrete addresses. Grounded on
/// `original_source/netio/nat.go` (`BidNatPacketConn`): `destination` is the
/// symbolic address the caller dialed, `source` is the real bound local
/// address. Uses [`Endpoint`] rather than the plain-`SocketAddr`
/// [`NdPacketConn`] trait because the whole point is preserving the FQDN
/// identity across the rewrite — a capability [`NdPacketConn`]'s signature
/// can't express.
pub struct BidiNatPacketConn {
    inner: Box<dyn NdPacketConn>,
    destination: Endpoint,
    source: Endpoint,
}

impl BidiNatPacketConn {
    pub fn new(inner: Box<dyn NdPacketConn>, destination: Endpoint, source: Endpoint) -> Self {
        Self { inner, destination, source }
    }

    /// Rewrites a write to the symbolic `destination` into a write to the
    /// real bound `source` address, preserving the caller-supplied port.
    pub async fn write_to(&self, buf: &[u8], dst: &Endpoint) -> std::io::Result<usize> {
        let target = if dst.no_port() == self.destination.no_port() {
            Endpoint::new(self.source.no_port(), dst.port())
        } else {
            dst.clone()
        };
        let addr = target
            .as_socket_addr()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "destination endpoint has no concrete address"))?;
        self.inner.send_to(buf, addr).await
    }

    /// Rewrites a reply's real source address back to the symbolic
    /// `destination`, so the caller keeps seeing the identity it dialed
    /// regardless of which resolved IP actually answered.
    pub async fn read_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        let (n, addr) = self.inner.recv_from(buf).await?;
        let actual_source = Endpoint::from(addr);
        let presented =
            if actual_source.no_port() == self.source.no_port() { Endpoint::new(self.destination.no_port(), addr.port()) } else { actual_source };
        Ok((n, presented))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::AtomicUsize;

    use super::*;

    struct NullWriter;

    impl PacketWriter for NullWriter {
        fn write_to<'a>(&'a self, buf: &'a [u8], _dst: SocketAddr) -> BoxFuture<'a, std::io::Result<usize>> {
            Box::pin(async move { Ok(buf.len()) })
        }
    }

    fn always_accept() -> Arc<dyn Prepare> {
        Arc::new(|_source: SocketAddr, _destination: SocketAddr, _first: &[u8]| {
            Some(PrepareResult { writer: Arc::new(NullWriter), handler: None, on_close: None })
        })
    }

    fn src(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)), port)
    }

    fn dst() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 53)
    }

    #[tokio::test]
    async fn new_packet_creates_once_and_refreshes_after() {
        let map = NatMap::new(always_accept(), DEFAULT_CAPACITY, DEFAULT_TIMEOUT);

        let (conn1, is_new1) = map.new_packet(b"first", src(1234), dst()).unwrap();
        assert!(is_new1);

        let (conn2, is_new2) = map.new_packet(b"second", src(1234), dst()).unwrap();
        assert!(!is_new2);
        assert!(Arc::ptr_eq(&conn1.0, &conn2.0));

        assert_eq!(conn1.read().await.unwrap().as_ref(), b"first");
        assert_eq!(conn1.read().await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn prepare_declining_drops_the_packet_without_creating_an_entry() {
        let prepare: Arc<dyn Prepare> = Arc::new(|_: SocketAddr, _: SocketAddr, _: &[u8]| None);
        let map = NatMap::new(prepare, DEFAULT_CAPACITY, DEFAULT_TIMEOUT);

        assert!(map.new_packet(b"hello", src(1), dst()).is_none());
    }

    #[tokio::test]
    async fn set_handler_drains_queued_packets_in_order_before_direct_delivery() {
        let map = NatMap::new(always_accept(), DEFAULT_CAPACITY, DEFAULT_TIMEOUT);

        let (conn, _) = map.new_packet(b"one", src(2), dst()).unwrap();
        map.new_packet(b"two", src(2), dst()).unwrap();
        map.new_packet(b"three", src(2), dst()).unwrap();

        let received: Arc<Mutex<Vec<Bytes>>> = Arc::new(Mutex::new(Vec::new()));

        struct Recorder(Arc<Mutex<Vec<Bytes>>>);
        impl PacketHandler for Recorder {
            fn on_packet(&self, packet: Bytes) {
                self.0.lock().push(packet);
            }
        }

        conn.set_handler(Arc::new(Recorder(received.clone())));

        let seen = received.lock();
        assert_eq!(seen.as_slice(), &[Bytes::from_static(b"one"), Bytes::from_static(b"two"), Bytes::from_static(b"three")]);
        drop(seen);

        map.new_packet(b"four", src(2), dst()).unwrap();
        assert_eq!(received.lock().last().unwrap().as_ref(), b"four");
    }

    #[tokio::test]
    async fn full_queue_drops_new_packets() {
        let map = NatMap::new(always_accept(), DEFAULT_CAPACITY, DEFAULT_TIMEOUT);
        let (conn, _) = map.new_packet(b"0", src(3), dst()).unwrap();

        for i in 1..DEFAULT_QUEUE_CAPACITY + 10 {
            map.new_packet(i.to_string().as_bytes(), src(3), dst()).unwrap();
        }

        let mut count = 0;
        while tokio::time::timeout(Duration::from_millis(1), conn.read()).await.is_ok() {
            count += 1;
        }
        assert_eq!(count, DEFAULT_QUEUE_CAPACITY, "queue must cap at its configured capacity, dropping the rest");
    }

    #[tokio::test]
    async fn on_close_fires_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let prepare: Arc<dyn Prepare> = Arc::new(move |_: SocketAddr, _: SocketAddr, _: &[u8]| {
            let calls = calls_clone.clone();
            Some(PrepareResult {
                writer: Arc::new(NullWriter),
                handler: None,
                on_close: Some(Box::new(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                })),
            })
        });

        let map = NatMap::new(prepare, DEFAULT_CAPACITY, DEFAULT_TIMEOUT);
        let (conn, _) = map.new_packet(b"hi", src(4), dst()).unwrap();

        conn.close();
        conn.close();
        map.close();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn eviction_closes_the_conn() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let prepare: Arc<dyn Prepare> = Arc::new(move |_: SocketAddr, _: SocketAddr, _: &[u8]| {
            let calls = calls_clone.clone();
            Some(PrepareResult { writer: Arc::new(NullWriter), handler: None, on_close: Some(Box::new(move || { calls.fetch_add(1, Ordering::SeqCst); })) })
        });

        // Capacity 1 (rounded up from a tiny requested capacity) with a
        // single shard forces the second distinct source to evict the first.
        let map = NatMap { shards: vec![Mutex::new(LruCache::new(NonZeroUsize::MIN))], prepare, timeout: DEFAULT_TIMEOUT };

        map.new_packet(b"a", src(10), dst()).unwrap();
        map.new_packet(b"b", src(11), dst()).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "the first source's entry must be closed on eviction");
    }

    #[tokio::test]
    async fn idle_timeout_evicts_and_fires_on_close_then_recreates() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let prepare: Arc<dyn Prepare> = Arc::new(move |_: SocketAddr, _: SocketAddr, _: &[u8]| {
            let calls = calls_clone.clone();
            Some(PrepareResult { writer: Arc::new(NullWriter), handler: None, on_close: Some(Box::new(move || { calls.fetch_add(1, Ordering::SeqCst); })) })
        });

        // A zero timeout means the slot is already expired the instant after
        // it's inserted, so the very next packet from the same source must
        // be treated as a new entry rather than refreshing the stale one.
        let map = NatMap::new(prepare, DEFAULT_CAPACITY, Duration::from_nanos(1));
        let (conn1, is_new1) = map.new_packet(b"first", src(7), dst()).unwrap();
        assert!(is_new1);

        tokio::time::sleep(Duration::from_millis(5)).await;

        let (conn2, is_new2) = map.new_packet(b"second", src(7), dst()).unwrap();
        assert!(is_new2, "an idle-expired entry must be recreated, not refreshed");
        assert!(!Arc::ptr_eq(&conn1.0, &conn2.0));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "the stale entry must be closed before being replaced");

        conn1.close();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "on_close only fires once even if the stale conn is closed again later");
    }

    #[tokio::test]
    async fn read_fails_after_close() {
        let map = NatMap::new(always_accept(), DEFAULT_CAPACITY, DEFAULT_TIMEOUT);
        let (conn, _) = map.new_packet(b"x", src(5), dst()).unwrap();
        conn.close();

        let err = conn.read().await.unwrap_err();
        assert!(matches!(err, Error::Closed));
    }

    #[tokio::test]
    async fn read_respects_deadline() {
        let map = NatMap::new(always_accept(), DEFAULT_CAPACITY, DEFAULT_TIMEOUT);
        let (conn, _) = map.new_packet(b"x", src(6), dst()).unwrap();
        let _ = conn.read().await.unwrap();

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(10)));
        let err = conn.read().await.unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }
}
