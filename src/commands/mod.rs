/// Commands the core needs itself
///
/// Concrete KV/timeseries/CRDT commands live outside this crate and plug in
/// through the `Command` trait; `Ping` backs the default health check and
/// `RawCommand` carries pre-serialized bodies.
use bytes::Bytes;

use crate::codec::codes;
use crate::core::Command;
use crate::error::RiakResult;

/// `RpbPingReq` / `RpbPingResp`, both code-only
#[derive(Debug, Clone, Default)]
pub struct Ping;

impl Ping {
    pub fn new() -> Self {
        Ping
    }
}

impl Command for Ping {
    type Output = ();

    fn name(&self) -> &'static str {
        "ping"
    }

    fn request_code(&self) -> u8 {
        codes::PING_REQ
    }

    fn response_code(&self) -> u8 {
        codes::PING_RESP
    }

    fn encode_body(&self) -> RiakResult<Option<Bytes>> {
        Ok(None)
    }

    fn on_response(&mut self, _body: Option<Bytes>) -> RiakResult<bool> {
        Ok(true)
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn into_output(self) -> Self::Output {}
}

type DonePredicate = Box<dyn Fn(Option<&Bytes>) -> bool + Send>;

/// Sends an already serialized body and collects the response bodies
///
/// By default the first response completes the command; `until` makes it a
/// streaming command that keeps reading until the predicate accepts a frame.
pub struct RawCommand {
    request_code: u8,
    response_code: u8,
    body: Option<Bytes>,
    responses: Vec<Bytes>,
    done: Option<DonePredicate>,
    idempotent: bool,
    retries: Option<u32>,
}

impl RawCommand {
    pub fn new(request_code: u8, response_code: u8, body: Option<Bytes>) -> Self {
        Self {
            request_code,
            response_code,
            body,
            responses: Vec::new(),
            done: None,
            idempotent: false,
            retries: None,
        }
    }

    /// Keep reading response frames until `predicate` returns true
    pub fn until<F>(mut self, predicate: F) -> Self
    where
        F: Fn(Option<&Bytes>) -> bool + Send + 'static,
    {
        self.done = Some(Box::new(predicate));
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Responses received so far in the current attempt
    pub fn responses(&self) -> &[Bytes] {
        &self.responses
    }
}

impl std::fmt::Debug for RawCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawCommand")
            .field("request_code", &self.request_code)
            .field("response_code", &self.response_code)
            .field("streaming", &self.done.is_some())
            .field("responses", &self.responses.len())
            .finish()
    }
}

impl Command for RawCommand {
    type Output = Vec<Bytes>;

    fn name(&self) -> &'static str {
        "raw"
    }

    fn request_code(&self) -> u8 {
        self.request_code
    }

    fn response_code(&self) -> u8 {
        self.response_code
    }

    fn encode_body(&self) -> RiakResult<Option<Bytes>> {
        Ok(self.body.clone())
    }

    fn on_response(&mut self, body: Option<Bytes>) -> RiakResult<bool> {
        let finished = match &self.done {
            Some(predicate) => predicate(body.as_ref()),
            None => true,
        };
        self.responses.push(body.unwrap_or_default());
        Ok(finished)
    }

    fn retries(&self) -> Option<u32> {
        self.retries
    }

    fn idempotent(&self) -> bool {
        self.idempotent
    }

    fn reset(&mut self) {
        self.responses.clear();
    }

    fn into_output(self) -> Self::Output {
        self.responses
    }
}
