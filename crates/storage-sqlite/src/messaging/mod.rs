mod model;
mod read_state;
mod repository;

pub use model::{ConversationDB, MembershipDB, MessageDB, UserDB};
pub use read_state::ReadStateRepository;
pub use repository::{apply_rows, MessagingRepository};
