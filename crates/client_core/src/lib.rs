pub mod api;
pub mod config;
pub mod connection;
pub mod conversation;
pub mod error;
pub mod reconcile;
pub mod registry;
pub mod session;
pub mod transport;

pub use api::{FileUpload, HttpMessagingApi, MessagingApi, StaticToken, TokenSource};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use connection::{
    BackoffPolicy, ConnectionManager, ConnectionState, ConnectionStatus, StateListenerId,
};
pub use conversation::{Conversation, ConversationKey};
pub use error::{ClientError, FetchError, SendError, TransportError};
pub use reconcile::{reconcile, Delivery, Message, UserDirectory};
pub use registry::{EnvelopeHandler, HandlerId, SubscriptionHandle, SubscriptionRegistry};
pub use session::{ConversationSession, SessionEvent};
pub use transport::{PushConnector, PushStream, WebSocketConnector};
