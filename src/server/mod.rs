use crate::config::Config;
use crate::proxy::Proxy;
use crate::upstream::Upstream;
use anyhow::{Context, Result};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{debug, error, info};

pub struct Server {
    listen: String,
    proxy: Arc<Proxy>,
}

impl Server {
    pub fn new(config: &Config) -> Result<Self> {
        let upstream = Upstream::from_config(&config.upstream)?;
        info!(
            "upstream has {} backends ({:?})",
            upstream.backends().len(),
            config.upstream.strategy
        );

        Ok(Self {
            listen: config.listen.clone(),
            proxy: Arc::new(Proxy::new(upstream)),
        })
    }

    pub fn proxy(&self) -> &Arc<Proxy> {
        &self.proxy
    }

    pub async fn run(&self) -> Result<()> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", self.listen))?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        self.proxy.start();
        info!("Listening on {}", addr);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let proxy = Arc::clone(&self.proxy);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let proxy = Arc::clone(&proxy);
                            async move { proxy.serve(req).await }
                        });

                        let builder = AutoBuilder::new(TokioExecutor::new());
                        if let Err(e) = builder.serve_connection(io, service).await {
                            debug!("Connection error from {}: {}", remote_addr, e);
                        }
                    });
                }
                _ = signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.proxy.stop();
        info!("Server stopped");

        Ok(())
    }
}
