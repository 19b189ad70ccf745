// ABOUTME: Tonic client streaming blocks from a Substreams endpoint
// ABOUTME: Buffers blocks to absorb shallow forks and retries stream errors from the cursor

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use async_stream::stream;
use futures::StreamExt;
use prost::Message as _;
use sha2::{Digest, Sha256};
use tonic::codec::CompressionEncoding;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::service::interceptor::InterceptedService;
use tonic::service::Interceptor;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};

use crate::cursor::{BlockRef, Cursor};
use crate::error::Error;
use crate::proto::sf::substreams::rpc::v2::{
    response::Message, stream_client::StreamClient, BlockScopedData, Request,
};
use crate::proto::sf::substreams::v1::{module, Module, Modules, Package};
use crate::sinker::{DATABASE_CHANGES_TYPE, LEGACY_DATABASE_CHANGES_TYPE};
use crate::stream::{BlockSource, EventStream, StreamEvent};

const RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Adds a bearer token to every request when one is configured.
#[derive(Clone)]
pub struct AuthInterceptor {
    token: Option<MetadataValue<Ascii>>,
}

impl AuthInterceptor {
    pub fn new(token: Option<String>) -> Result<Self, Error> {
        let token = token
            .map(|t| format!("Bearer {t}").parse::<MetadataValue<Ascii>>())
            .transpose()
            .map_err(|_| Error::Config("API token is not a valid header value".to_string()))?;
        Ok(Self { token })
    }
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: tonic::Request<()>) -> Result<tonic::Request<()>, tonic::Status> {
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        Ok(request)
    }
}

/// Read an spkg from a local path or fetch it over HTTP(S).
pub async fn load_package(manifest: &str) -> Result<Package, Error> {
    let bytes = if manifest.starts_with("http://") || manifest.starts_with("https://") {
        let response = reqwest::get(manifest).await?.error_for_status()?;
        response.bytes().await?.to_vec()
    } else {
        tokio::fs::read(manifest).await?
    };
    Ok(Package::decode(bytes.as_slice())?)
}

/// Identifier of the upstream transformation, used to key cursor rows.
///
/// Hashes the prost-encoded modules in the dependency closure of the
/// output module, in declaration order, plus the wasm binaries they run.
/// Stable per package version; changes whenever the package changes.
pub fn output_module_hash(modules: &Modules, output_module: &str) -> Result<String, Error> {
    let by_name: HashMap<&str, &Module> = modules
        .modules
        .iter()
        .map(|m| (m.name.as_str(), m))
        .collect();

    let mut needed: HashSet<&str> = HashSet::new();
    let mut stack = vec![output_module];
    while let Some(name) = stack.pop() {
        if !needed.insert(name) {
            continue;
        }
        let module = by_name
            .get(name)
            .ok_or_else(|| Error::UnknownModule(name.to_string()))?;
        for input in &module.inputs {
            match &input.input {
                Some(module::input::Input::Map(map)) => stack.push(&map.module_name),
                Some(module::input::Input::Store(store)) => stack.push(&store.module_name),
                _ => {}
            }
        }
    }

    let mut hasher = Sha256::new();
    for module in &modules.modules {
        if !needed.contains(module.name.as_str()) {
            continue;
        }
        hasher.update(module.encode_to_vec());
        if let Some(binary) = modules.binaries.get(module.binary_index as usize) {
            hasher.update(&binary.content);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Streams `DatabaseChanges` blocks from a Substreams endpoint.
// Cloning is cheap and shares the underlying connection.
#[derive(Clone)]
pub struct SubstreamsClient {
    stream_client: StreamClient<InterceptedService<Channel, AuthInterceptor>>,
    modules: Modules,
    output_module: String,
    module_hash: String,
    start_block: i64,
    stop_block: u64,
    /// Blocks held back to absorb shallow forks without surfacing undo
    /// signals. Zero forwards every undo downstream.
    undo_buffer_size: usize,
    final_blocks_only: bool,
}

impl SubstreamsClient {
    #[allow(clippy::too_many_arguments)]
    pub async fn connect(
        endpoint: &str,
        package: &Package,
        output_module: &str,
        start_block: Option<u64>,
        stop_block: u64,
        undo_buffer_size: usize,
        final_blocks_only: bool,
        api_token: Option<String>,
    ) -> Result<Self, Error> {
        let modules = package
            .modules
            .clone()
            .ok_or_else(|| Error::Config("package has no modules".to_string()))?;

        let module = modules
            .modules
            .iter()
            .find(|m| m.name == output_module)
            .ok_or_else(|| Error::UnknownModule(output_module.to_string()))?;
        validate_output_module(module)?;

        let module_hash = output_module_hash(&modules, output_module)?;
        let start_block = start_block
            .map(|b| b as i64)
            .unwrap_or(module.initial_block as i64);

        let stream_client = {
            let uri = Uri::from_str(endpoint)
                .map_err(|e| Error::Config(format!("invalid endpoint {endpoint:?}: {e}")))?;
            let tls = uri.scheme_str() == Some("https");
            let mut endpoint = Endpoint::from(uri);
            if tls {
                endpoint = endpoint.tls_config(ClientTlsConfig::new().with_native_roots())?;
            }
            let channel = endpoint.connect().await?;
            let auth = AuthInterceptor::new(api_token)?;
            StreamClient::with_interceptor(channel, auth)
                .accept_compressed(CompressionEncoding::Gzip)
                .send_compressed(CompressionEncoding::Gzip)
                .max_decoding_message_size(100 * 1024 * 1024) // 100MiB
        };

        Ok(Self {
            stream_client,
            modules,
            output_module: output_module.to_string(),
            module_hash,
            start_block,
            stop_block,
            undo_buffer_size,
            final_blocks_only,
        })
    }

    pub fn output_module(&self) -> &str {
        &self.output_module
    }

    pub fn module_hash(&self) -> &str {
        &self.module_hash
    }

    /// First block streamed, after resolving the module's initial block.
    pub fn start_block(&self) -> u64 {
        self.start_block.max(0) as u64
    }

    fn request(&self, cursor: &str) -> Request {
        Request {
            start_block_num: self.start_block,
            start_cursor: cursor.to_string(),
            stop_block_num: self.stop_block,
            final_blocks_only: self.final_blocks_only,
            production_mode: true,
            output_module: self.output_module.clone(),
            modules: Some(self.modules.clone()),
            debug_initial_store_snapshot_for_modules: vec![],
        }
    }
}

fn validate_output_module(module: &Module) -> Result<(), Error> {
    if !matches!(module.kind, Some(module::Kind::KindMap(_))) {
        return Err(Error::Config(format!(
            "module {} is not a map module",
            module.name
        )));
    }

    let output_type = module
        .output
        .as_ref()
        .map(|o| o.r#type.as_str())
        .unwrap_or_default();
    let type_name = output_type.strip_prefix("proto:").unwrap_or(output_type);
    if type_name != DATABASE_CHANGES_TYPE && type_name != LEGACY_DATABASE_CHANGES_TYPE {
        return Err(Error::Config(format!(
            "module {} outputs {output_type:?}, expected a DatabaseChanges type",
            module.name
        )));
    }
    Ok(())
}

fn block_event(data: BlockScopedData) -> StreamEvent {
    let clock = data.clock.clone().unwrap_or_default();
    let is_live = clock.number >= data.final_block_height;
    let cursor = Cursor::new(data.cursor.clone(), BlockRef::new(clock.number, clock.id));
    StreamEvent::BlockScopedData {
        data,
        is_live,
        cursor,
    }
}

impl BlockSource for SubstreamsClient {
    /// Continuous event stream resuming from `resume`.
    ///
    /// Stream errors are logged and retried from the last delivered
    /// cursor; blocks still sitting in the undo buffer are re-fetched.
    fn events(&self, resume: Cursor) -> EventStream {
        let mut client = self.stream_client.clone();
        let this = self.clone();

        Box::pin(stream! {
            let mut cursor = resume.cursor.clone();
            let mut last_sent_block: Option<u64> =
                (!resume.is_blank()).then_some(resume.block.num);

            'retry: loop {
                let request = tonic::Request::new(this.request(&cursor));
                let mut blocks = match client.blocks(request).await {
                    Ok(response) => response.into_inner(),
                    // An error at connection time is unexpected, don't retry.
                    Err(status) => {
                        yield Err(status.into());
                        return;
                    }
                };

                let mut buffer: VecDeque<BlockScopedData> = VecDeque::new();

                while let Some(message) = blocks.next().await {
                    match message {
                        Ok(response) => match response.message {
                            Some(Message::BlockScopedData(data)) => {
                                if data.clock.is_none() || data.output.is_none() {
                                    continue;
                                }
                                buffer.push_back(data);
                                while buffer.len() > this.undo_buffer_size {
                                    let data = buffer.pop_front().expect("buffer not empty");
                                    cursor = data.cursor.clone();
                                    let event = block_event(data);
                                    if let StreamEvent::BlockScopedData { cursor: c, .. } = &event {
                                        last_sent_block = Some(c.block.num);
                                    }
                                    yield Ok(event);
                                }
                            }
                            Some(Message::BlockUndoSignal(undo)) => {
                                let last_valid = undo.last_valid_block.unwrap_or_default();
                                buffer.retain(|d| {
                                    d.clock
                                        .as_ref()
                                        .is_some_and(|c| c.number <= last_valid.number)
                                });

                                if last_sent_block.is_some_and(|b| b > last_valid.number) {
                                    cursor = undo.last_valid_cursor.clone();
                                    last_sent_block = Some(last_valid.number);
                                    yield Ok(StreamEvent::BlockUndoSignal {
                                        last_valid_block: BlockRef::new(
                                            last_valid.number,
                                            last_valid.id.clone(),
                                        ),
                                        cursor: Cursor::new(
                                            undo.last_valid_cursor,
                                            BlockRef::new(last_valid.number, last_valid.id),
                                        ),
                                    });
                                } else {
                                    tracing::debug!(
                                        last_valid_block = last_valid.number,
                                        "fork absorbed by the undo buffer"
                                    );
                                }
                            }
                            Some(Message::FatalError(err)) => {
                                yield Err(Error::UpstreamFatal(err.reason));
                                return;
                            }
                            // session init and progress messages are ignored
                            _ => {}
                        },
                        Err(status) => {
                            tracing::warn!(
                                error = %status,
                                "error reading substreams stream, retrying in {}s",
                                RETRY_BACKOFF.as_secs()
                            );
                            tokio::time::sleep(RETRY_BACKOFF).await;
                            continue 'retry;
                        }
                    }
                }

                // Natural end of stream: whatever is still buffered can no
                // longer be undone by this session, deliver it.
                while let Some(data) = buffer.pop_front() {
                    cursor = data.cursor.clone();
                    yield Ok(block_event(data));
                }
                break;
            }
        })
    }
}
