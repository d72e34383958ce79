pub mod comment;
pub mod like;
pub mod user;
pub mod video;

pub use comment::Entity as Comment;
pub use like::Entity as Like;
pub use user::Entity as User;
pub use video::Entity as Video;
pub use video::VideoStatus;
