//! Client side of the adapter protocol, used by the command-line tools and
//! by integration tests. Mirrors the DTN2-style `dtn_open`/`dtn_register`/
//! `dtn_send`/`dtn_recv` call surface (§4.9) as async methods over a single
//! TCP connection.

use tokio::net::TcpStream;

use crate::error::ApiError;
use crate::protocol::{BundleSpec, RegInfo, Request, Response, WireBundle};
use crate::wire::{read_response, write_request};

pub struct ApiClient {
    stream: TcpStream,
}

impl ApiClient {
    pub async fn connect(addr: &str) -> Result<Self, ApiError> {
        let stream = TcpStream::connect(addr).await?;
        let mut client = ApiClient { stream };
        client.call(Request::Open).await?;
        Ok(client)
    }

    async fn call(&mut self, req: Request) -> Result<Response, ApiError> {
        write_request(&mut self.stream, &req).await?;
        read_response(&mut self.stream).await
    }

    pub async fn close(mut self) -> Result<(), ApiError> {
        self.call(Request::Close).await?;
        Ok(())
    }

    pub async fn local_eid(&mut self) -> Result<String, ApiError> {
        match self.call(Request::LocalEid).await? {
            Response::LocalEid { eid } => Ok(eid),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn register(&mut self, info: RegInfo) -> Result<u32, ApiError> {
        match self.call(Request::Register(info)).await? {
            Response::Regid { regid } => Ok(regid),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn unregister(&mut self, regid: u32) -> Result<(), ApiError> {
        expect_ok(self.call(Request::Unregister { regid }).await?)
    }

    pub async fn find_registration(&mut self, eid: &str) -> Result<Option<u32>, ApiError> {
        match self.call(Request::FindRegistration { eid: eid.to_string() }).await? {
            Response::Found { regid } => Ok(regid),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn bind(&mut self, regid: u32) -> Result<(), ApiError> {
        expect_ok(self.call(Request::Bind { regid }).await?)
    }

    pub async fn send(&mut self, bundle: BundleSpec, payload: Vec<u8>) -> Result<(), ApiError> {
        expect_ok(self.call(Request::Send { bundle, payload }).await?)
    }

    pub async fn recv(&mut self, timeout_ms: Option<u64>) -> Result<Option<WireBundle>, ApiError> {
        match self.call(Request::Recv { timeout_ms }).await? {
            Response::Bundle { bundle } => Ok(bundle),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn begin_poll(&mut self, timeout_ms: Option<u64>) -> Result<Option<WireBundle>, ApiError> {
        match self.call(Request::BeginPoll { timeout_ms }).await? {
            Response::Bundle { bundle } => Ok(bundle),
            resp => Err(unexpected(resp)),
        }
    }

    pub async fn cancel_poll(&mut self) -> Result<(), ApiError> {
        expect_ok(self.call(Request::CancelPoll).await?)
    }
}

fn expect_ok(resp: Response) -> Result<(), ApiError> {
    match resp {
        Response::Ok => Ok(()),
        resp => Err(unexpected(resp)),
    }
}

/// Reports an error response's message and maps it to a local `ApiError`;
/// also the fallback for any response shape a call doesn't expect.
fn unexpected(resp: Response) -> ApiError {
    match resp {
        Response::Error { code, message } => {
            log::warn!("api call rejected (code {code}): {message}");
        }
        other => log::warn!("unexpected response variant: {other:?}"),
    }
    ApiError::Closed
}
