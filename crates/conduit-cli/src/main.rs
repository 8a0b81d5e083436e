use std::path::Path;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use conduit_core::queue::RoutingKind;
use conduit_core::saga::{ExecutionContext, HttpRemoteCaller};
use conduit_core::{
    Broker, Config, ErrorKind, Message, MessageKind, Priority, QueueConfig, QueueError,
    RocksDbStorage, SagaDefinition, SagaEngine, SagaError, StepDispatcher,
};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "conduit", about = "Conduit queue and saga CLI")]
struct Cli {
    /// Data directory (overrides config and CONDUIT_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage queues
    #[command(subcommand)]
    Queue(QueueCommands),

    /// Send a message to a queue
    Send {
        queue: String,

        /// Message payload, stored as raw bytes
        payload: String,

        /// low, normal, high or critical
        #[arg(long, default_value = "normal")]
        priority: String,

        /// command, event, query or reply
        #[arg(long, default_value = "command")]
        kind: String,

        /// Header as key=value (repeatable)
        #[arg(long = "header")]
        headers: Vec<String>,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Receive the next deliverable message of a queue
    Receive {
        queue: String,

        #[arg(long, default_value = "conduit-cli")]
        consumer: String,
    },

    /// Mark an in-flight message completed
    Complete { queue: String, id: String },

    /// Mark an in-flight message failed
    Fail {
        queue: String,
        id: String,

        #[arg(long, default_value = "failed via cli")]
        error: String,
    },

    /// Show a stored message
    Get { id: String },

    /// Move dead-lettered messages back to the queue they came from
    Redrive {
        /// DLQ queue name (e.g. "orders.dlq")
        dlq_name: String,

        /// Maximum number of messages to redrive (0 = all)
        #[arg(long, default_value = "0")]
        count: u64,
    },

    /// Manage sagas
    #[command(subcommand)]
    Saga(SagaCommands),
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Create a new queue
    Create {
        name: String,

        /// direct, topic, fanout or headers
        #[arg(long, default_value = "direct")]
        routing: String,

        /// Dead-letter queue name
        #[arg(long)]
        dlq: Option<String>,

        #[arg(long)]
        retry_limit: Option<u32>,

        #[arg(long)]
        max_length: Option<u64>,

        /// Message time-to-live in milliseconds
        #[arg(long)]
        ttl: Option<u64>,

        /// Visibility timeout in milliseconds
        #[arg(long)]
        visibility_timeout: Option<u64>,
    },

    /// List all queues
    List,

    /// Show queue counters and rates
    Stats { name: String },
}

#[derive(Subcommand)]
enum SagaCommands {
    /// Register a saga definition from a JSON file
    Define { file: String },

    /// Execute a saga and wait for it to finish
    Run {
        id: String,

        /// Initial context as a JSON object
        #[arg(long, default_value = "{}")]
        context: String,
    },

    /// Show an execution
    Get { execution_id: String },

    /// List executions
    List {
        /// Only executions of this saga
        #[arg(long)]
        saga: Option<String>,
    },

    /// Time out executions past their deadline that nothing is running
    Sweep,
}

fn load_config() -> Config {
    let paths = ["conduit.toml", "/etc/conduit/conduit.toml"];

    for path in &paths {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        info!(path, "loaded configuration");
                        return config;
                    }
                    Err(e) => die(format!("error parsing {path}: {e}")),
                },
                Err(e) => die(format!("error reading {path}: {e}")),
            }
        }
    }

    info!("no config file found, using defaults");
    Config::default()
}

fn die(message: impl AsRef<str>) -> ! {
    eprintln!("{}", message.as_ref());
    process::exit(1);
}

fn format_error(kind: ErrorKind, message: String, context: &str) -> String {
    match kind {
        ErrorKind::NotFound => format!("Error: {context} does not exist"),
        ErrorKind::Validation | ErrorKind::BusinessLogic => format!("Error: {message}"),
    }
}

fn queue_failure(err: QueueError, context: &str) -> ! {
    die(format_error(err.kind(), err.to_string(), context))
}

fn saga_failure(err: SagaError, context: &str) -> ! {
    die(format_error(err.kind(), err.to_string(), context))
}

fn parse_id(raw: &str) -> Uuid {
    Uuid::parse_str(raw).unwrap_or_else(|_| die(format!("Error: invalid id \"{raw}\"")))
}

fn parse_or_die<T>(raw: &str) -> T
where
    T: std::str::FromStr<Err = QueueError>,
{
    raw.parse()
        .unwrap_or_else(|e: QueueError| die(format!("Error: {e}")))
}

fn plural(n: u64) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

fn print_message(msg: &Message) {
    println!("Message: {}", msg.id);
    println!("  Queue:        {}", msg.queue);
    println!("  Kind:         {:?}", msg.kind);
    println!("  Priority:     {}", msg.priority);
    println!("  Status:       {}", msg.status);
    println!("  Retry count:  {}", msg.retry_count);
    println!("  Content-Type: {}", msg.content_type());
    if let Some(correlation_id) = &msg.correlation_id {
        println!("  Correlation:  {correlation_id}");
    }
    if let Some(error) = &msg.last_error {
        println!("  Last error:   {error}");
    }
    println!("  Payload:      {}", String::from_utf8_lossy(&msg.payload));
}

async fn cmd_queue_create(broker: &Broker, config: QueueConfig) {
    let name = config.name.clone();
    match broker.create_queue(config).await {
        Ok(receipt) => println!("Queue \"{name}\" {}", receipt.status.as_str()),
        Err(e) => queue_failure(e, &format!("queue \"{name}\"")),
    }
}

async fn cmd_queue_list(broker: &Broker) {
    let queues = broker
        .list_queues()
        .await
        .unwrap_or_else(|e| queue_failure(e, "queues"));
    if queues.is_empty() {
        println!("No queues found.");
        return;
    }

    let name_width = queues
        .iter()
        .map(|q| q.config.name.len())
        .max()
        .unwrap_or(4)
        .max(4);

    println!(
        "{:<name_width$}  {:>7}  {:>10}  {:>9}  {:>6}  {:>11}",
        "NAME", "PENDING", "PROCESSING", "COMPLETED", "FAILED", "DEAD_LETTER"
    );
    for q in &queues {
        println!(
            "{:<name_width$}  {:>7}  {:>10}  {:>9}  {:>6}  {:>11}",
            q.config.name,
            q.metrics.pending,
            q.metrics.processing,
            q.metrics.completed,
            q.metrics.failed,
            q.metrics.dead_letter
        );
    }
}

async fn cmd_queue_stats(broker: &Broker, name: String) {
    let m = broker
        .get_queue_metrics(&name)
        .await
        .unwrap_or_else(|e| queue_failure(e, &format!("queue \"{name}\"")));
    println!("Queue: {name}");
    println!("  Total:       {}", m.total);
    println!("  Pending:     {}", m.pending);
    println!("  Processing:  {}", m.processing);
    println!("  Completed:   {}", m.completed);
    println!("  Failed:      {}", m.failed);
    println!("  Dead letter: {}", m.dead_letter);
    println!("  Retried:     {}", m.retried);
    println!("  Error rate:  {:.2}%", m.error_rate);
    println!("  Throughput:  {:.3}/s", m.throughput_per_sec);
}

async fn cmd_redrive(broker: &Broker, dlq_name: String, count: u64) {
    match broker.redrive(&dlq_name, count).await {
        Ok(redriven) => println!(
            "Redrove {redriven} message{} from \"{dlq_name}\"",
            plural(redriven)
        ),
        Err(e) => queue_failure(e, &format!("queue \"{dlq_name}\"")),
    }
}

async fn cmd_saga_define(engine: &SagaEngine, file: String) {
    let contents = std::fs::read_to_string(&file)
        .unwrap_or_else(|e| die(format!("error reading {file}: {e}")));
    let def: SagaDefinition = serde_json::from_str(&contents)
        .unwrap_or_else(|e| die(format!("error parsing {file}: {e}")));
    let id = def.id.clone();
    match engine.define_saga(def).await {
        Ok(receipt) => println!(
            "Saga \"{id}\": {} step{}, {} compensation{}",
            receipt.step_count,
            plural(receipt.step_count as u64),
            receipt.compensation_step_count,
            plural(receipt.compensation_step_count as u64)
        ),
        Err(e) => saga_failure(e, &format!("saga \"{id}\"")),
    }
}

async fn cmd_saga_run(engine: &SagaEngine, id: String, context: String) {
    let context: ExecutionContext = serde_json::from_str(&context)
        .unwrap_or_else(|e| die(format!("Error: context must be a JSON object: {e}")));
    match engine.execute_saga(&id, context).await {
        Ok(receipt) => println!(
            "Execution {}: {} ({}/{} steps)",
            receipt.execution_id, receipt.status, receipt.current_step, receipt.total_steps
        ),
        Err(e) => saga_failure(e, &format!("saga \"{id}\"")),
    }
}

fn cmd_saga_get(engine: &SagaEngine, execution_id: String) {
    let id = parse_id(&execution_id);
    let exec = engine
        .get_execution(&id)
        .unwrap_or_else(|e| saga_failure(e, &format!("execution \"{execution_id}\"")));
    let record =
        serde_json::to_string_pretty(&exec).unwrap_or_else(|e| die(format!("Error: {e}")));
    let context = serde_json::to_string_pretty(&exec.context)
        .unwrap_or_else(|e| die(format!("Error: {e}")));
    println!("{record}");
    println!("context: {context}");
}

fn cmd_saga_list(engine: &SagaEngine, saga: Option<String>) {
    let executions = engine
        .list_executions(saga.as_deref())
        .unwrap_or_else(|e| saga_failure(e, "executions"));
    if executions.is_empty() {
        println!("No executions found.");
        return;
    }

    let saga_width = executions
        .iter()
        .map(|e| e.definition_id.len())
        .max()
        .unwrap_or(4)
        .max(4);
    println!("{:<36}  {:<saga_width$}  {:<12}  STEP", "EXECUTION", "SAGA", "STATUS");
    for e in &executions {
        println!(
            "{:<36}  {:<saga_width$}  {:<12}  {}/{}",
            e.id.to_string(),
            e.definition_id,
            e.status.as_str(),
            e.current_step,
            e.total_steps
        );
    }
}

#[tokio::main]
async fn main() {
    conduit_core::telemetry::init_tracing("warn");

    let cli = Cli::parse();
    let mut config = load_config();
    if let Ok(dir) = std::env::var("CONDUIT_DATA_DIR") {
        config.storage.data_dir = dir;
    }
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    let storage = match RocksDbStorage::open(&config.storage.data_dir) {
        Ok(storage) => Arc::new(storage),
        Err(e) => die(format!(
            "Error: cannot open data directory {}: {e}",
            config.storage.data_dir
        )),
    };
    let broker = match Broker::new(&config, storage.clone()) {
        Ok(broker) => Arc::new(broker),
        Err(e) => die(format!("Error: {e}")),
    };

    let remote = HttpRemoteCaller::new(Duration::from_millis(config.saga.remote_call_timeout_ms))
        .unwrap_or_else(|e| die(format!("Error: cannot build http client: {e}")));
    let dispatcher = StepDispatcher::new()
        .with_remote_caller(Arc::new(remote))
        .with_publisher(broker.clone());
    let engine = SagaEngine::new(storage, dispatcher, &config.saga);

    match cli.command {
        Commands::Queue(cmd) => match cmd {
            QueueCommands::Create {
                name,
                routing,
                dlq,
                retry_limit,
                max_length,
                ttl,
                visibility_timeout,
            } => {
                let mut queue = QueueConfig::new(name)
                    .with_retry_limit(retry_limit.unwrap_or(config.retry.default_retry_limit));
                queue.routing = parse_or_die::<RoutingKind>(&routing);
                if let Some(dlq) = dlq {
                    queue = queue.with_dead_letter_queue(dlq);
                }
                if let Some(max_length) = max_length {
                    queue = queue.with_max_length(max_length);
                }
                if let Some(ttl) = ttl {
                    queue = queue.with_message_ttl_ms(ttl);
                }
                if let Some(timeout) = visibility_timeout {
                    queue = queue.with_visibility_timeout_ms(timeout);
                }
                cmd_queue_create(&broker, queue).await
            }
            QueueCommands::List => cmd_queue_list(&broker).await,
            QueueCommands::Stats { name } => cmd_queue_stats(&broker, name).await,
        },
        Commands::Send {
            queue,
            payload,
            priority,
            kind,
            headers,
            correlation_id,
        } => {
            let kind = parse_or_die::<MessageKind>(&kind);
            let mut msg = Message::new(queue, kind, payload.into_bytes())
                .with_priority(parse_or_die::<Priority>(&priority));
            for header in &headers {
                let Some((key, value)) = header.split_once('=') else {
                    die(format!("Error: header \"{header}\" must be key=value"));
                };
                msg = msg.with_header(key, value);
            }
            if let Some(correlation_id) = correlation_id {
                msg = msg.with_correlation_id(correlation_id);
            }
            let context = format!("queue \"{}\"", msg.queue);
            match broker.send_message(msg).await {
                Ok(receipt) => println!(
                    "Sent {} to \"{}\" ({:.3} ms)",
                    receipt.id, receipt.queue, receipt.processing_time_ms
                ),
                Err(e) => queue_failure(e, &context),
            }
        }
        Commands::Receive { queue, consumer } => {
            match broker.receive_message(&queue, &consumer).await {
                Ok(Some(msg)) => print_message(&msg),
                Ok(None) => println!("No message available."),
                Err(e) => queue_failure(e, &format!("queue \"{queue}\"")),
            }
        }
        Commands::Complete { queue, id } => {
            match broker.complete_message(parse_id(&id), &queue).await {
                Ok(receipt) => println!("Message {}: {}", receipt.id, receipt.status),
                Err(e) => queue_failure(e, &format!("message \"{id}\"")),
            }
        }
        Commands::Fail { queue, id, error } => {
            match broker.fail_message(parse_id(&id), &queue, &error).await {
                Ok(receipt) => {
                    println!("Message {}: {}", receipt.id, receipt.status);
                    if let Some(retry_count) = receipt.retry_count {
                        println!("  Retry count:   {retry_count}");
                    }
                    if let Some(next_retry_at) = receipt.next_retry_at {
                        println!("  Next retry at: {next_retry_at} ns");
                    }
                }
                Err(e) => queue_failure(e, &format!("message \"{id}\"")),
            }
        }
        Commands::Get { id } => match broker.get_message(parse_id(&id)).await {
            Ok(msg) => print_message(&msg),
            Err(e) => queue_failure(e, &format!("message \"{id}\"")),
        },
        Commands::Redrive { dlq_name, count } => cmd_redrive(&broker, dlq_name, count).await,
        Commands::Saga(cmd) => match cmd {
            SagaCommands::Define { file } => cmd_saga_define(&engine, file).await,
            SagaCommands::Run { id, context } => cmd_saga_run(&engine, id, context).await,
            SagaCommands::Get { execution_id } => cmd_saga_get(&engine, execution_id),
            SagaCommands::List { saga } => cmd_saga_list(&engine, saga),
            SagaCommands::Sweep => match engine.sweep_expired(conduit_core::clock::now_ns()).await
            {
                Ok(handled) => println!(
                    "Timed out {handled} execution{}",
                    plural(handled as u64)
                ),
                Err(e) => saga_failure(e, "executions"),
            },
        },
    }

    // The engine's dispatcher holds a broker handle; the scheduler stops
    // once the last one is dropped.
    drop(engine);
    drop(broker);
}
