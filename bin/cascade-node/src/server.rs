//! TCP server speaking the Cascade frame protocol
//!
//! Requests on one connection are pipelined: each is dispatched as its own
//! task and responses carry the request's sequence number, so a parked
//! load (waiting on an upstream fill) never blocks later requests.

use crate::store::FsStore;
use bytes::Bytes;
use cascade_cache::{BlobPeer, CacheHandle};
use cascade_common::{Error, Result};
use cascade_proto::{Request, RequestFrame, Response, ResponseFrame, read_frame, write_frame};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct NodeServer {
    handle: CacheHandle,
    /// Backing store implementation a register-backing request activates
    backing: Option<Arc<FsStore>>,
    max_frame: usize,
}

impl NodeServer {
    pub fn new(handle: CacheHandle, backing: Option<Arc<FsStore>>, max_frame: usize) -> Self {
        Self {
            handle,
            backing,
            max_frame,
        }
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let server = Arc::new(self);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "connection accepted");
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                if let Err(err) = serve_connection(server, stream).await {
                    warn!(%addr, %err, "connection error");
                }
            });
        }
    }

    async fn handle_request(&self, request: Request) -> Response {
        match request {
            Request::Load { hash } => match self.handle.load_raw(hash).await {
                Ok((data, ephemeral)) => Response::Load { data, ephemeral },
                Err(err) => Response::Error(err),
            },
            Request::Store { data } => match self.handle.store(data).await {
                Ok(hash) => Response::Store {
                    hash: Bytes::copy_from_slice(hash.as_bytes()),
                },
                Err(err) => Response::Error(err),
            },
            Request::Flush => Response::from_empty(self.handle.flush().await),
            Request::DropCache => Response::from_empty(self.handle.drop_cache().await),
            Request::StatsGet => match self.handle.stats().await {
                Ok(stats) => Response::Stats(stats),
                Err(err) => Response::Error(err),
            },
            Request::RegisterBacking { name } => match &self.backing {
                Some(store) => {
                    let store: Arc<FsStore> = Arc::clone(store);
                    let peer: Arc<dyn BlobPeer> = store;
                    Response::from_empty(self.handle.register_backing(&name, peer).await)
                }
                None => Response::Error(Error::NoBackingService),
            },
            Request::UnregisterBacking => {
                Response::from_empty(self.handle.unregister_backing().await)
            }
            Request::Map { path, blob_size } => match self.handle.map(&path, blob_size).await {
                Ok(blobrefs) => Response::Map { blobrefs },
                Err(err) => Response::Error(err),
            },
            Request::Unmap { path } => Response::from_empty(self.handle.unmap(&path).await),
        }
    }
}

async fn serve_connection(server: Arc<NodeServer>, stream: TcpStream) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();

    // Single writer task; request tasks funnel their responses through it
    let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<ResponseFrame>();
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = resp_rx.recv().await {
            if write_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = read_frame::<_, RequestFrame>(&mut reader, server.max_frame).await? {
        let server = Arc::clone(&server);
        let resp_tx = resp_tx.clone();
        tokio::spawn(async move {
            let body = server.handle_request(frame.body).await;
            let _ = resp_tx.send(ResponseFrame {
                seq: frame.seq,
                body,
            });
        });
    }
    drop(resp_tx);
    let _ = writer_task.await;
    Ok(())
}
