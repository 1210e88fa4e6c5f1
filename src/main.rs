use async_trait::async_trait;
use switchyard::config::Config;
use switchyard::error::HttpError;
use switchyard::http::pipeline::Pipeline;
use switchyard::http::request::RequestMessage;
use switchyard::http::response::{Reply, Response, StatusCode, StreamingResponse};
use switchyard::server::Server;
use tracing::Level;

/// `/` greets, `/echo` streams the request body straight back.
struct DemoPipeline;

#[async_trait]
impl Pipeline for DemoPipeline {
    fn is_stream(&self, request: &RequestMessage) -> bool {
        request.path == "/echo"
    }

    async fn handle(&self, request: &RequestMessage) -> Result<Reply, HttpError> {
        match request.path.as_str() {
            "/" => Ok(Response::ok("Hello from switchyard\n").into()),
            "/echo" => {
                let body = request
                    .stream()
                    .cloned()
                    .ok_or_else(|| HttpError::server_error("echo body was not streamed"))?;
                Ok(StreamingResponse::new(StatusCode::OK, move |mut out| async move {
                    while let Some(chunk) = body.receive().await {
                        out.write(chunk.content).await?;
                        if !chunk.more_content {
                            break;
                        }
                    }
                    Ok(())
                })
                .into())
            }
            _ => Ok(Response::not_found().into()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if cfg.debug { Level::DEBUG } else { Level::INFO })
        .init();

    Server::new(cfg, DemoPipeline).run()
}
