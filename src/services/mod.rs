pub mod block_splitter;
pub mod bulk_service;
pub mod cache_mover;
pub mod crypto;
pub mod digest_service;
pub mod duplicate_detector;
pub mod engine;
pub mod events;
pub mod failure;
pub mod folder_scanner;
pub mod fs_drive;
pub mod remote;
pub mod retry;
pub mod upload_pipeline;
pub mod upload_store;
pub mod work_queue;
