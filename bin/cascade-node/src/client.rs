//! Wire client for the TBON parent
//!
//! Each RPC opens a fresh connection; the load engine already bounds
//! concurrency to one in-flight load per digest and the flush window
//! bounds stores, so connection churn stays modest.

use async_trait::async_trait;
use bytes::Bytes;
use cascade_cache::BlobPeer;
use cascade_common::{Digest, Error, Result};
use cascade_proto::{Request, RequestFrame, Response, ResponseFrame, read_frame, write_frame};
use tokio::net::TcpStream;

pub struct ParentClient {
    addr: String,
    max_frame: usize,
}

impl ParentClient {
    pub fn new(addr: impl Into<String>, max_frame: usize) -> Self {
        Self {
            addr: addr.into(),
            max_frame,
        }
    }

    async fn rpc(&self, body: Request) -> Result<Response> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, &RequestFrame { seq: 0, body }).await?;
        match read_frame::<_, ResponseFrame>(&mut stream, self.max_frame).await? {
            Some(frame) => Ok(frame.body),
            None => Err(Error::Io("parent closed the connection".into())),
        }
    }
}

#[async_trait]
impl BlobPeer for ParentClient {
    async fn load(&self, hash: Digest) -> Result<(Bytes, bool)> {
        let request = Request::Load {
            hash: Bytes::copy_from_slice(hash.as_bytes()),
        };
        match self.rpc(request).await? {
            Response::Load { data, ephemeral } => Ok((data, ephemeral)),
            Response::Error(err) => Err(err),
            _ => Err(Error::protocol("unexpected response to load")),
        }
    }

    async fn store(&self, data: Bytes) -> Result<Digest> {
        match self.rpc(Request::Store { data }).await? {
            Response::Store { hash } => {
                Digest::from_slice(&hash).ok_or_else(|| Error::protocol("bad digest width"))
            }
            Response::Error(err) => Err(err),
            _ => Err(Error::protocol("unexpected response to store")),
        }
    }
}
