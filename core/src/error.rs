//! Crate-level error taxonomy and its user-visible HTTP mapping.

use thiserror::Error;

use crate::{
	config::ConfigError, couch::CouchError, job::JobError, sharing::SharingError, vfs::VfsError,
};

#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Couch(#[from] CouchError),
	#[error(transparent)]
	Vfs(#[from] VfsError),
	#[error(transparent)]
	Job(#[from] JobError),
	#[error(transparent)]
	Sharing(#[from] SharingError),
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error("internal error: {0}")]
	Internal(String),
}

impl Error {
	/// The HTTP status the error maps to when surfaced to a user.
	pub fn status_code(&self) -> u16 {
		match self {
			Error::Couch(e) => match e {
				CouchError::NotFound { .. } | CouchError::Deleted { .. } => 404,
				CouchError::Conflict { .. } => 409,
				_ => 500,
			},
			Error::Vfs(e) => match e {
				VfsError::NotFound(_) | VfsError::ParentDoesNotExist => 404,
				VfsError::Exists(_) => 409,
				VfsError::FileTooBig | VfsError::QuotaExceeded => 413,
				VfsError::InvalidHash
				| VfsError::ContentLengthMismatch { .. }
				| VfsError::InvalidName(_)
				| VfsError::ForbiddenDocMove
				| VfsError::FileInTrash
				| VfsError::ParentInTrash => 400,
				_ => 500,
			},
			Error::Job(e) => match e {
				JobError::UnknownWorker(_) | JobError::UnknownTrigger(_) => 404,
				JobError::BadTrigger(_) | JobError::InvalidTrigger(_) => 400,
				_ => 500,
			},
			Error::Sharing(e) => match e {
				SharingError::Unauthorized => 401,
				SharingError::Forbidden | SharingError::Safety => 403,
				SharingError::NotFound | SharingError::MemberNotFound => 404,
				SharingError::AlreadyAccepted => 409,
				SharingError::InvalidSharing
				| SharingError::InvalidRules
				| SharingError::NoRecipients
				| SharingError::MissingFileMetadata
				| SharingError::BadState => 400,
				_ => 500,
			},
			_ => 500,
		}
	}
}
