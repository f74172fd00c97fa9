//! DNS wire types: `Query`/`Response` wrappers around `domain`'s message
//! types, small record-building helpers, and the `Transport` capability
//! trait shared by the cache, client and the UDP/TCP/local transports.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use domain::base::{HeaderCounts, Message, MessageBuilder, ParsedName, Question, RecordSection, name::FlattenInto};
use domain::dep::octseq::OctetsInto;
use domain::rdata::AllRecordData;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const MAX_NAME_LEN: usize = domain::base::Name::MAX_LEN;

pub type RecordType = domain::base::iana::Rtype;
pub type RecordClass = domain::base::iana::Class;

pub type DomainNameRef<'a> = domain::base::Name<&'a [u8]>;
pub type Record<'a> =
    domain::base::Record<ParsedName<&'a [u8]>, AllRecordData<&'a [u8], ParsedName<&'a [u8]>>>;
pub type RecordData<'a> = AllRecordData<&'a [u8], ParsedName<&'a [u8]>>;

pub type DomainName = domain::base::Name<Vec<u8>>;
pub type OwnedRecord = domain::base::Record<DomainName, AllRecordData<Vec<u8>, DomainName>>;
pub type OwnedRecordData = AllRecordData<Vec<u8>, DomainName>;

pub type ResponseCode = domain::base::iana::Rcode;
pub type Ttl = domain::base::Ttl;

/// EDNS(0) parameters as negotiated by the request (RFC 6891).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdnsOpt {
    pub udp_payload_size: u16,
    pub version: u8,
    pub dnssec_ok: bool,
}

#[derive(Clone)]
pub struct Query {
    inner: Message<Vec<u8>>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("qid", &self.inner.header().id())
            .field("type", &self.qtype())
            .field("domain", &self.domain())
            .finish()
    }
}

impl Query {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if message.header().qr() {
            return Err(Error::NotAQuery);
        }

        let _ = message.sole_question()?;

        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self { inner: message.octets_into() })
    }

    /// Builds a fresh query: RD=1, a random id, compression enabled, and an
    /// EDNS(0) OPT advertising `udp_payload_size` (default 1232, per §6).
    pub fn new(domain: DomainName, rtype: RecordType, udp_payload_size: u16) -> Self {
        let mut builder = MessageBuilder::new_vec().question();
        builder.header_mut().set_qr(false);
        builder.header_mut().set_rd(true);
        builder.header_mut().set_random_id();

        builder
            .push((domain, rtype))
            .expect("vec-backed message builder never fails");

        let mut additional = builder.additional();
        additional
            .opt(|opt| {
                opt.set_udp_payload_size(udp_payload_size);
                Ok(())
            })
            .expect("vec-backed message builder never fails");

        Self { inner: additional.into_message() }
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);
        self
    }

    pub fn with_ad(mut self, ad: bool) -> Self {
        self.inner.header_mut().set_ad(ad);
        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn qclass(&self) -> RecordClass {
        self.question().qclass()
    }

    pub fn edns(&self) -> Option<EdnsOpt> {
        let opt = self.inner.opt()?;
        Some(EdnsOpt {
            udp_payload_size: opt.udp_payload_size(),
            version: opt.version(),
            dnssec_ok: opt.dnssec_ok(),
        })
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.inner.into_octets()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }
}

impl TryFrom<&[u8]> for Query {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

/// An inbound request, before the single-question shape the rest of this
/// workspace assumes is known to hold. The cache's `LoadOrStore` boundary
/// (§4.4, §8) is defined in terms of question count, which only this type
/// (rather than [`Query`], which already enforces exactly one) can still
/// observe.
#[derive(Debug)]
pub enum Request {
    /// No question at all: the cache contract is a synthetic `FORMERR`,
    /// with no network I/O.
    NoQuestion { id: u16 },
    /// Exactly one question: the common case, usable everywhere a [`Query`]
    /// is expected.
    Single(Query),
    /// More than one question: caching is disabled for this message shape,
    /// but the raw bytes are retained so the constructor can still be
    /// invoked on them directly (§4.4) rather than answered locally.
    Multiple { id: u16, bytes: Vec<u8> },
}

impl Request {
    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;
        let id = message.header().id();

        match message.header_counts().qdcount() {
            0 => Ok(Request::NoQuestion { id }),
            1 => Query::parse(slice).map(Request::Single),
            _ => Ok(Request::Multiple { id, bytes: slice.to_vec() }),
        }
    }

    pub fn id(&self) -> u16 {
        match self {
            Request::NoQuestion { id } | Request::Multiple { id, .. } => *id,
            Request::Single(query) => query.id(),
        }
    }
}

impl TryFrom<&[u8]> for Response {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Self::parse(slice)
    }
}

#[derive(Clone)]
pub struct Response {
    inner: Message<Vec<u8>>,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("qid", &self.inner.header().id())
            .field("domain", &self.domain())
            .field("type", &self.qtype())
            .field("response_code", &self.response_code())
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn no_error(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NOERROR).build()
    }

    pub fn servfail(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::SERVFAIL).build()
    }

    pub fn nxdomain(query: &Query) -> Self {
        ResponseBuilder::for_query(query, ResponseCode::NXDOMAIN).build()
    }

    /// Synthesizes a `FORMERR` response for a request that carries no
    /// question at all (cache contract: zero questions never touch the
    /// network).
    pub fn formerr_for_id(id: u16) -> Self {
        let mut inner = MessageBuilder::new_vec();
        inner.header_mut().set_id(id);
        inner.header_mut().set_qr(true);
        inner.header_mut().set_rcode(ResponseCode::FORMERR);
        Self { inner: inner.into_message() }
    }

    pub fn parse(slice: &[u8]) -> Result<Self, Error> {
        let message = Message::from_octets(slice).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        let _ = message.sole_question()?;

        for record in message.answer()? {
            record?.into_any_record::<AllRecordData<_, _>>()?;
        }

        Ok(Self { inner: message.octets_into() })
    }

    /// Wraps a raw reply from [`Transport::exchange_raw`] without enforcing
    /// the single-question invariant [`Response::parse`] does. Used only for
    /// the multi-question forward path (§4.4): such a response is relayed to
    /// the caller as-is, never cached, TTL-rewritten, or EDNS-fixed-up, so
    /// none of the accessors that assume exactly one question are exercised
    /// on it.
    pub fn parse_passthrough(bytes: Vec<u8>) -> Result<Self, Error> {
        let message = Message::from_octets(bytes).map_err(|_| Error::TooShort)?;

        if !message.header().qr() {
            return Err(Error::NotAResponse);
        }

        Ok(Self { inner: message })
    }

    pub fn with_id(mut self, id: u16) -> Self {
        self.inner.header_mut().set_id(id);
        self
    }

    pub fn id(&self) -> u16 {
        self.inner.header().id()
    }

    pub fn truncated(&self) -> bool {
        self.inner.header().tc()
    }

    /// `Question` count. Cache only stores/serves messages with exactly 1.
    pub fn question_count(&self) -> u16 {
        self.inner.header_counts().qdcount()
    }

    pub fn domain(&self) -> DomainName {
        self.question().into_qname().flatten_into()
    }

    pub fn qtype(&self) -> RecordType {
        self.question().qtype()
    }

    pub fn qclass(&self) -> RecordClass {
        self.question().qclass()
    }

    pub fn response_code(&self) -> ResponseCode {
        self.inner.header().rcode()
    }

    pub fn edns(&self) -> Option<EdnsOpt> {
        let opt = self.inner.opt()?;
        Some(EdnsOpt {
            udp_payload_size: opt.udp_payload_size(),
            version: opt.version(),
            dnssec_ok: opt.dnssec_ok(),
        })
    }

    /// Minimum TTL across Answer ∪ Ns ∪ Extra, per §4.4 `Store`.
    pub fn min_ttl(&self) -> Option<Ttl> {
        self.answer_ns_extra_ttls().min()
    }

    fn answer_ns_extra_ttls(&self) -> impl Iterator<Item = Ttl> + '_ {
        let answer = self.inner.answer().expect("verified in ctor").into_iter();
        let authority = self.inner.authority().ok().into_iter().flatten();
        let additional = self.inner.additional().ok().into_iter().flatten();
        answer
            .chain(authority)
            .chain(additional)
            .filter_map(|r| r.ok())
            .map(|r| r.ttl())
    }

    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.answer().into_iter().map(|r| {
            r.expect("verified in ctor")
                .into_any_record::<AllRecordData<_, _>>()
                .expect("verified in ctor")
        })
    }

    /// Rebuilds this response with every Answer/Ns/Extra TTL replaced by
    /// `ttl`, and the header id replaced by `id`. Used by the cache to serve
    /// a live entry without mutating the stored copy (§4.4 "TTL overwrite").
    /// The OPT pseudo-record (if any) is carried over unchanged: its "ttl"
    /// packs EDNS flags, not a cache lifetime.
    pub fn with_rewritten_ttls(&self, ttl: Ttl, id: u16) -> Response {
        let code = self.response_code();
        let mut builder = MessageBuilder::new_vec()
            .start_answer(&self.inner, code)
            .expect("vec-backed message builder never fails");

        for record in self.records() {
            let owner: DomainName = record.owner().flatten_into();
            let data: OwnedRecordData = record.data().clone().octets_into();
            let owned = OwnedRecord::new(owner, record.class(), ttl, data);
            builder.push(owned).expect("vec-backed message builder never fails");
        }

        let mut authority = builder.authority();
        for record in self.inner.authority().ok().into_iter().flatten() {
            let Some(record) = record.ok().and_then(|r| r.into_any_record::<AllRecordData<_, _>>().ok()) else { continue };
            let owner: DomainName = record.owner().flatten_into();
            let data: OwnedRecordData = record.data().clone().octets_into();
            let owned = OwnedRecord::new(owner, record.class(), ttl, data);
            authority.push(owned).expect("vec-backed message builder never fails");
        }

        let mut additional = authority.additional();
        for record in self.inner.additional().ok().into_iter().flatten() {
            let Ok(record) = record else { continue };
            if record.rtype() == RecordType::OPT {
                continue;
            }
            let Ok(record) = record.into_any_record::<AllRecordData<_, _>>() else { continue };
            let owner: DomainName = record.owner().flatten_into();
            let data: OwnedRecordData = record.data().clone().octets_into();
            let owned = OwnedRecord::new(owner, record.class(), ttl, data);
            additional.push(owned).expect("vec-backed message builder never fails");
        }

        if let Some(opt) = self.inner.opt() {
            additional
                .opt(|new_opt| {
                    new_opt.set_udp_payload_size(opt.udp_payload_size());
                    new_opt.set_version(opt.version());
                    new_opt.set_dnssec_ok(opt.dnssec_ok());
                    Ok(())
                })
                .expect("vec-backed message builder never fails");
        }

        let mut inner = additional.into_message();
        inner.header_mut().set_id(id);
        Response { inner }
    }

    /// EDNS(0) backwards-fixup (§4.4): a response's OPT only needs fixing up
    /// when the response carries one the request can't have asked for — no
    /// EDNS on the request, or a request version below the response's. In
    /// that case the OPT is stripped, and re-added (request's UDP size,
    /// response's DO bit, version reset to 0) only if the request itself had
    /// EDNS. Otherwise the response is returned untouched, so this is a
    /// no-op on a response that's already been fixed up.
    pub fn edns_backwards_fixup(&self, request_edns: Option<EdnsOpt>) -> Response {
        let Some(response_edns) = self.edns() else {
            return self.clone();
        };
        let needs_strip = request_edns.is_none_or(|req| req.version < response_edns.version);
        if !needs_strip {
            return self.clone();
        }

        let code = self.response_code();
        let mut builder = MessageBuilder::new_vec()
            .start_answer(&self.inner, code)
            .expect("vec-backed message builder never fails");

        for record in self.records() {
            let owner: DomainName = record.owner().flatten_into();
            let ttl = record.ttl();
            let data: OwnedRecordData = record.data().clone().octets_into();
            let owned = OwnedRecord::new(owner, record.class(), ttl, data);
            builder.push(owned).expect("vec-backed message builder never fails");
        }

        let mut authority = builder.authority();
        for record in self.inner.authority().ok().into_iter().flatten() {
            let Some(record) = record.ok().and_then(|r| r.into_any_record::<AllRecordData<_, _>>().ok()) else { continue };
            let owner: DomainName = record.owner().flatten_into();
            let owned = OwnedRecord::new(owner, record.class(), record.ttl(), record.data().clone().octets_into());
            authority.push(owned).expect("vec-backed message builder never fails");
        }

        let mut additional = authority.additional();
        for record in self.inner.additional().ok().into_iter().flatten() {
            let Ok(record) = record else { continue };
            if record.rtype() == RecordType::OPT {
                continue;
            }
            let Ok(record) = record.into_any_record::<AllRecordData<_, _>>() else { continue };
            let owner: DomainName = record.owner().flatten_into();
            let owned = OwnedRecord::new(owner, record.class(), record.ttl(), record.data().clone().octets_into());
            additional.push(owned).expect("vec-backed message builder never fails");
        }

        if let Some(req) = request_edns {
            additional
                .opt(|opt| {
                    opt.set_udp_payload_size(req.udp_payload_size);
                    opt.set_dnssec_ok(response_edns.dnssec_ok);
                    Ok(())
                })
                .expect("vec-backed message builder never fails");
        }

        let mut inner = additional.into_message();
        inner.header_mut().set_id(self.id());
        Response { inner }
    }

    /// Serializes, truncating (and setting TC) if the payload exceeds
    /// `max_len`.
    pub fn into_bytes(self, max_len: u16) -> Vec<u8> {
        let qid = self.inner.header().id();

        let len = self.inner.as_slice().len();
        if len <= max_len as usize {
            return self.inner.into_octets();
        }

        tracing::debug!(%len, %max_len, %qid, domain = %self.domain(), "truncating DNS response");

        let mut inner = self.inner;
        inner.header_mut().set_tc(true);

        let start_of_answer = inner.answer().expect("verified in ctor").pos();

        let mut bytes = inner.into_octets();
        bytes.truncate(start_of_answer);

        let header_counts = HeaderCounts::for_message_slice_mut(&mut bytes);
        header_counts.as_slice_mut().fill(0);
        header_counts.set_qdcount(1);

        bytes
    }

    fn question(&self) -> Question<ParsedName<&[u8]>> {
        self.inner.sole_question().expect("verified in ctor")
    }

    fn answer(&self) -> RecordSection<'_, Vec<u8>> {
        self.inner.answer().expect("verified in ctor")
    }
}

pub struct ResponseBuilder {
    query: Message<Vec<u8>>,
    code: ResponseCode,
    records: Vec<OwnedRecord>,
    ad: bool,
    aa: bool,
    ra: bool,
    edns: Option<EdnsOpt>,
}

impl ResponseBuilder {
    pub fn for_query(query: &Query, code: ResponseCode) -> Self {
        Self { query: query.inner.clone(), code, records: Vec::new(), ad: false, aa: false, ra: false, edns: None }
    }

    pub fn with_records(mut self, records: impl IntoIterator<Item: Into<OwnedRecord>>) -> Self {
        self.records.extend(records.into_iter().map(Into::into));
        self
    }

    pub fn with_ad(mut self, ad: bool) -> Self {
        self.ad = ad;
        self
    }

    /// Sets AA (authoritative) and RA (recursion available); used by
    /// synthesized responses (e.g. a hosts-file short-circuit) that never
    /// touch the network but still need to look like a complete answer.
    pub fn with_authoritative_and_recursion_available(mut self) -> Self {
        self.aa = true;
        self.ra = true;
        self
    }

    pub fn with_edns(mut self, edns: EdnsOpt) -> Self {
        self.edns = Some(edns);
        self
    }

    pub fn build(self) -> Response {
        let mut answer = MessageBuilder::new_vec()
            .start_answer(&self.query, self.code)
            .expect("vec-backed message builder never fails");
        answer.header_mut().set_ad(self.ad);
        answer.header_mut().set_aa(self.aa);
        answer.header_mut().set_ra(self.ra);

        for record in self.records {
            answer.push(record).expect("vec-backed message builder never fails");
        }

        let inner = match self.edns {
            Some(edns) => {
                let mut additional = answer.additional();
                additional
                    .opt(|opt| {
                        opt.set_udp_payload_size(edns.udp_payload_size);
                        opt.set_version(edns.version);
                        opt.set_dnssec_ok(edns.dnssec_ok);
                        Ok(())
                    })
                    .expect("vec-backed message builder never fails");
                additional.into_message()
            }
            None => answer.into_message(),
        };

        Response { inner }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bytes slice is too short to contain a message")]
    TooShort,
    #[error("DNS message is not a query")]
    NotAQuery,
    #[error("DNS message is not a response")]
    NotAResponse,
    #[error(transparent)]
    Parse(#[from] domain::base::wire::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The capability every DNS transport (UDP mux, TCP, local-resolver,
/// cache-wrapped client) implements. Modeled as a narrow, dyn-compatible
/// trait per the design note on dynamic dispatch for `Transport`/`Dialer`/
/// `ParallelDialer`/`PacketHandler`/`PacketWriter`.
pub trait Transport: Send + Sync {
    fn exchange<'a>(&'a self, query: &'a Query) -> BoxFuture<'a, Result<Response, Error>>;

    /// Raw byte-level forward for a message that doesn't fit [`Query`]'s
    /// single-question invariant (§4.4: a multi-question request bypasses
    /// the cache entirely but is still handed to the constructor, unparsed,
    /// rather than answered locally). Transports that only ever see
    /// single-question traffic can leave this at its default.
    fn exchange_raw<'a>(&'a self, _message: &'a [u8]) -> BoxFuture<'a, Result<Vec<u8>, Error>> {
        Box::pin(std::future::ready(Err(Error::NotAQuery)))
    }
}

pub mod records {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    use domain::rdata::{A, Aaaa, Ptr, Srv, Txt, rfc1035::TxtError};

    use super::*;

    pub fn ptr(domain: DomainName) -> OwnedRecordData {
        OwnedRecordData::Ptr(Ptr::new(domain))
    }

    pub fn a(ip: Ipv4Addr) -> OwnedRecordData {
        OwnedRecordData::A(A::new(ip))
    }

    pub fn aaaa(ip: Ipv6Addr) -> OwnedRecordData {
        OwnedRecordData::Aaaa(Aaaa::new(ip))
    }

    pub fn ip(ip: IpAddr) -> OwnedRecordData {
        match ip {
            IpAddr::V4(ip) => a(ip),
            IpAddr::V6(ip) => aaaa(ip),
        }
    }

    pub fn txt(content: Vec<u8>) -> Result<OwnedRecordData, TxtError> {
        Ok(OwnedRecordData::Txt(Txt::from_octets(content)?))
    }

    pub fn srv(priority: u16, weight: u16, port: u16, target: DomainName) -> OwnedRecordData {
        OwnedRecordData::Srv(Srv::new(priority, weight, port, target))
    }

    #[expect(clippy::wildcard_enum_match_arm, reason = "we only want A and AAAA records")]
    pub fn extract_ip(r: Record<'_>) -> Option<IpAddr> {
        match r.into_data() {
            RecordData::A(a) => Some(a.addr().into()),
            RecordData::Aaaa(aaaa) => Some(aaaa.addr().into()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn can_truncate_response() {
        let domain = DomainName::vec_from_str("example.com").unwrap();

        let query = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records(std::iter::repeat_n((domain.clone(), 1, records::a(Ipv4Addr::LOCALHOST)), 1000))
            .build();

        let bytes = response.into_bytes(1000);

        let parsed_response = Response::parse(&bytes).unwrap();

        assert!(parsed_response.truncated());
        assert_eq!(parsed_response.records().count(), 0);
        assert_eq!(parsed_response.domain(), domain);
    }

    #[test]
    fn request_parses_single_question_as_query() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain, RecordType::A, 1232);
        let bytes = query.clone().into_bytes();

        let request = Request::parse(&bytes).unwrap();
        assert!(matches!(request, Request::Single(_)));
        assert_eq!(request.id(), query.id());
    }

    #[test]
    fn request_parses_zero_questions() {
        let response = Response::formerr_for_id(0xBEEF);
        let bytes = response.into_bytes(u16::MAX);

        let request = Request::parse(&bytes).unwrap();
        assert!(matches!(request, Request::NoQuestion { id: 0xBEEF }));
    }

    #[test]
    fn formerr_has_no_question() {
        let response = Response::formerr_for_id(0xBEEF);
        assert_eq!(response.id(), 0xBEEF);
        assert_eq!(response.response_code(), ResponseCode::FORMERR);
        assert_eq!(response.question_count(), 0);
    }

    #[test]
    fn rewritten_ttl_applies_to_every_record() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_records([(domain.clone(), 60, records::a(Ipv4Addr::new(192, 0, 2, 1)))])
            .build();

        let rewritten = response.with_rewritten_ttls(Ttl::from_secs(30), 0xBEEF);

        assert_eq!(rewritten.id(), 0xBEEF);
        for record in rewritten.records() {
            assert_eq!(record.ttl(), Ttl::from_secs(30));
        }
    }

    #[test]
    fn edns_fixup_strips_opt_when_request_had_none() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query_with_edns = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query_with_edns, ResponseCode::NOERROR).build();

        assert!(response.edns().is_none(), "ResponseBuilder never adds an OPT");

        let fixed = response.edns_backwards_fixup(None);
        assert!(fixed.edns().is_none());
    }

    #[test]
    fn edns_fixup_strips_when_request_has_no_edns() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_edns(EdnsOpt { udp_payload_size: 1232, version: 0, dnssec_ok: true })
            .build();

        assert!(response.edns().is_some());

        let fixed = response.edns_backwards_fixup(None);
        assert!(fixed.edns().is_none(), "request without EDNS must not get an OPT back");
    }

    #[test]
    fn edns_fixup_reduces_udp_size_to_requests() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_edns(EdnsOpt { udp_payload_size: 4096, version: 0, dnssec_ok: true })
            .build();

        let request_edns = EdnsOpt { udp_payload_size: 512, version: 1, dnssec_ok: false };
        let fixed = response.edns_backwards_fixup(Some(request_edns));

        // request version (1) >= response version (0): no strip needed.
        let edns = fixed.edns().unwrap();
        assert_eq!(edns.udp_payload_size, 4096);
    }

    #[test]
    fn edns_fixup_leaves_response_untouched_when_versions_allow() {
        let domain = DomainName::vec_from_str("example.com").unwrap();
        let query = Query::new(domain.clone(), RecordType::A, 1232);
        let response = ResponseBuilder::for_query(&query, ResponseCode::NOERROR)
            .with_edns(EdnsOpt { udp_payload_size: 4096, version: 0, dnssec_ok: false })
            .build();

        let request_edns = EdnsOpt { udp_payload_size: 512, version: 0, dnssec_ok: true };
        let fixed = response.edns_backwards_fixup(Some(request_edns));

        let edns = fixed.edns().unwrap();
        assert_eq!(edns.udp_payload_size, 4096, "response version <= request version: untouched");
    }
}
