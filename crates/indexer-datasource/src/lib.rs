pub mod buffer;
pub mod datasource;
pub mod gateway;
pub mod subscriptions;

pub use buffer::{BufferedMessage, MessageBuffer};
pub use datasource::{Datasource, DatasourceMessage};
pub use gateway::{HttpGateway, HttpGatewayConfig};
pub use subscriptions::SubscriptionTracker;
