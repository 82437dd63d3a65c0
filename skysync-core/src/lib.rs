mod client;
mod metadata;
mod remote;

pub use client::{ApiErrorClass, HttpRemoteClient, RemoteError};
pub use metadata::{
    DeletedMetadata, FileMetadata, FolderMetadata, ListFolderPage, LongpollResult, Metadata,
    WriteMode,
};
pub use remote::RemoteClient;
pub use reqwest::StatusCode;
