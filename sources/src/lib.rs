pub mod cron;
pub mod http;
pub mod kafka;
pub mod lambda;
pub mod loader;
pub mod servicebus;
pub mod sqs;

pub use cron::CronSource;
pub use http::HttpSource;
pub use kafka::KafkaSource;
pub use lambda::LambdaSource;
pub use loader::SourceLoader;
pub use servicebus::ServiceBusSource;
pub use sqs::SqsSource;
