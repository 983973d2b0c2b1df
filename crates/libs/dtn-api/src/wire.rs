//! Frame codec for the adapter protocol: a 4-byte big-endian type code, a
//! 4-byte big-endian length, and an `rmp-serde` payload (§4.9).

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ApiError;
use crate::protocol::{Request, Response};

/// Frames larger than this are refused rather than trusted to allocate.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, type_code: u32, payload: &[u8]) -> Result<(), ApiError> {
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(ApiError::FrameTooLarge);
    }
    w.write_u32(type_code).await?;
    w.write_u32(payload.len() as u32).await?;
    w.write_all(payload).await?;
    w.flush().await?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(u32, Vec<u8>), ApiError> {
    let type_code = r.read_u32().await?;
    let len = r.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(ApiError::FrameTooLarge);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok((type_code, buf))
}

pub async fn write_request<W: AsyncWrite + Unpin>(w: &mut W, req: &Request) -> Result<(), ApiError> {
    let payload = rmp_serde::to_vec_named(req)?;
    write_frame(w, req.type_code(), &payload).await
}

pub async fn read_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<Request, ApiError> {
    let (_type_code, payload) = read_frame(r).await?;
    Ok(rmp_serde::from_slice(&payload)?)
}

pub async fn write_response<W: AsyncWrite + Unpin>(w: &mut W, resp: &Response) -> Result<(), ApiError> {
    let payload = rmp_serde::to_vec_named(resp)?;
    write_frame(w, resp.type_code(), &payload).await
}

pub async fn read_response<R: AsyncRead + Unpin>(r: &mut R) -> Result<Response, ApiError> {
    let (_type_code, payload) = read_frame(r).await?;
    Ok(rmp_serde::from_slice(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BundleSpec, RegInfo, WireFailureAction, WirePriority};

    #[tokio::test]
    async fn request_round_trips_through_frame_codec() {
        let req = Request::Send {
            bundle: BundleSpec {
                destination: "dtn://b/app".into(),
                reply_to: None,
                lifetime_secs: 3600,
                priority: WirePriority::Expedited,
                custody: true,
                delivery_receipt: false,
                do_not_fragment: false,
            },
            payload: vec![1, 2, 3, 4],
        };
        let mut buf = Vec::new();
        write_request(&mut buf, &req).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_request(&mut cursor).await.unwrap();
        match decoded {
            Request::Send { bundle, payload } => {
                assert_eq!(bundle.destination, "dtn://b/app");
                assert_eq!(payload, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_round_trips() {
        let req = Request::Register(RegInfo {
            pattern: "dtn://a/*".into(),
            failure_action: WireFailureAction::Defer,
            expiration_secs: 0,
            init_passive: false,
        });
        let mut buf = Vec::new();
        write_request(&mut buf, &req).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = read_request(&mut cursor).await.unwrap();
        assert!(matches!(decoded, Request::Register(_)));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_frame(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ApiError::FrameTooLarge));
    }
}
