//! File documents and content metadata extraction.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::couch::{impl_doc, FILES};

use super::{check_name, directory::DocPatch, CozyMetadata, DocRef, VfsError, Vfs, ROOT_DIR_ID};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDoc {
	#[serde(rename = "type", default = "file_type")]
	pub kind: String,
	#[serde(rename = "_id", default, skip_serializing_if = "String::is_empty")]
	pub doc_id: String,
	#[serde(rename = "_rev", default, skip_serializing_if = "String::is_empty")]
	pub doc_rev: String,
	#[serde(default)]
	pub name: String,
	#[serde(default)]
	pub dir_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub restore_path: String,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub tags: Vec<String>,
	#[serde(rename = "size", default)]
	pub byte_size: u64,
	/// Hex-encoded md5 of the content.
	#[serde(default)]
	pub md5sum: String,
	#[serde(default)]
	pub mime: String,
	#[serde(default)]
	pub class: String,
	#[serde(default)]
	pub executable: bool,
	#[serde(default)]
	pub trashed: bool,
	/// Pointer into the object store, for content-addressed back-ends.
	#[serde(rename = "internal_vfs_id", default, skip_serializing_if = "String::is_empty")]
	pub internal_id: String,
	#[serde(default, skip_serializing_if = "Map::is_empty")]
	pub metadata: Map<String, Value>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub referenced_by: Vec<DocRef>,
	#[serde(rename = "cozyMetadata", default, skip_serializing_if = "Option::is_none")]
	pub cozy_metadata: Option<CozyMetadata>,
}

fn file_type() -> String {
	"file".to_owned()
}

impl_doc!(FileDoc, FILES);

impl FileDoc {
	/// Builds a file document. The name is validated; an empty mime type
	/// is derived from the extension.
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		name: &str,
		dir_id: &str,
		byte_size: u64,
		md5sum: String,
		mime: String,
		class: String,
		executable: bool,
	) -> Result<Self, VfsError> {
		check_name(name)?;
		let (mime, class) = if mime.is_empty() {
			mime_and_class_from_name(name)
		} else {
			let class = if class.is_empty() {
				class_from_mime(&mime).to_owned()
			} else {
				class
			};
			(mime, class)
		};
		let now = Utc::now();
		Ok(Self {
			kind: file_type(),
			doc_id: String::new(),
			doc_rev: String::new(),
			name: name.to_owned(),
			dir_id: if dir_id.is_empty() {
				ROOT_DIR_ID.to_owned()
			} else {
				dir_id.to_owned()
			},
			restore_path: String::new(),
			created_at: now,
			updated_at: now,
			tags: Vec::new(),
			byte_size,
			md5sum,
			mime,
			class,
			executable,
			trashed: false,
			internal_id: String::new(),
			metadata: Map::new(),
			referenced_by: Vec::new(),
			cozy_metadata: None,
		})
	}

	pub fn add_referenced_by(&mut self, refs: &[DocRef]) {
		for r in refs {
			if !self.referenced_by.contains(r) {
				self.referenced_by.push(r.clone());
			}
		}
	}

	pub fn remove_referenced_by(&mut self, refs: &[DocRef]) {
		self.referenced_by.retain(|r| !refs.contains(r));
	}
}

/// Renames, moves or retags a file without touching its content.
pub async fn modify_file_metadata(
	fs: &dyn Vfs,
	olddoc: &FileDoc,
	patch: DocPatch,
) -> Result<FileDoc, VfsError> {
	let mut newdoc = olddoc.clone();
	if let Some(name) = patch.name {
		check_name(&name)?;
		newdoc.name = name;
	}
	if let Some(dir_id) = patch.dir_id {
		if olddoc.trashed {
			return Err(VfsError::FileInTrash);
		}
		newdoc.dir_id = dir_id;
	}
	if let Some(restore_path) = patch.restore_path {
		newdoc.restore_path = restore_path;
	}
	if let Some(tags) = patch.tags {
		newdoc.tags = tags;
	}
	newdoc.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
	fs.update_file_doc(olddoc, &mut newdoc).await?;
	Ok(newdoc)
}

/// Derives the mime type and class of a file from its extension.
pub fn mime_and_class_from_name(name: &str) -> (String, String) {
	let ext = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
	let mime = match ext.as_deref() {
		Some("txt") | Some("md") => "text/plain",
		Some("html") | Some("htm") => "text/html",
		Some("css") => "text/css",
		Some("csv") => "text/csv",
		Some("js") => "text/javascript",
		Some("json") => "application/json",
		Some("pdf") => "application/pdf",
		Some("zip") => "application/zip",
		Some("png") => "image/png",
		Some("jpg") | Some("jpeg") => "image/jpeg",
		Some("gif") => "image/gif",
		Some("svg") => "image/svg+xml",
		Some("mp3") => "audio/mpeg",
		Some("ogg") => "audio/ogg",
		Some("mp4") => "video/mp4",
		Some("webm") => "video/webm",
		_ => "application/octet-stream",
	};
	(mime.to_owned(), class_from_mime(mime).to_owned())
}

/// The coarse class of a mime type, used for filtering in applications.
pub fn class_from_mime(mime: &str) -> &'static str {
	match mime {
		"application/pdf" => "pdf",
		"application/zip" => "zip",
		m if m.starts_with("image/") => "image",
		m if m.starts_with("audio/") => "audio",
		m if m.starts_with("video/") => "video",
		m if m.starts_with("text/") => "text",
		_ => "files",
	}
}

/// How many bytes of a file the extractor buffers for sniffing.
const SNIFF_LEN: usize = 256 * 1024;

/// Collects the head of a file while it is written, to sniff its content
/// type and extract image dimensions.
#[derive(Default)]
pub struct MetaExtractor {
	head: Vec<u8>,
}

impl MetaExtractor {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn write(&mut self, chunk: &[u8]) {
		if self.head.len() < SNIFF_LEN {
			let take = (SNIFF_LEN - self.head.len()).min(chunk.len());
			self.head.extend_from_slice(&chunk[..take]);
		}
	}

	/// Sniffs the content type from magic numbers, `None` when the head is
	/// not recognized.
	pub fn sniff_mime(&self) -> Option<&'static str> {
		let head = &self.head;
		if head.starts_with(b"\x89PNG\r\n\x1a\n") {
			Some("image/png")
		} else if head.starts_with(b"\xff\xd8\xff") {
			Some("image/jpeg")
		} else if head.starts_with(b"GIF87a") || head.starts_with(b"GIF89a") {
			Some("image/gif")
		} else if head.starts_with(b"%PDF-") {
			Some("application/pdf")
		} else if head.starts_with(b"PK\x03\x04") {
			Some("application/zip")
		} else {
			None
		}
	}

	/// Finalizes the extraction, patching the document's mime, class and
	/// metadata (image dimensions when they can be decoded from the head).
	pub fn apply(&self, doc: &mut FileDoc) {
		if let Some(mime) = self.sniff_mime() {
			doc.mime = mime.to_owned();
			doc.class = class_from_mime(mime).to_owned();
		}
		if doc.class == "image" {
			if let Ok(reader) =
				image::ImageReader::new(Cursor::new(&self.head)).with_guessed_format()
			{
				if let Ok((width, height)) = reader.into_dimensions() {
					doc.metadata.insert("width".to_owned(), width.into());
					doc.metadata.insert("height".to_owned(), height.into());
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mime_detection_from_name() {
		let (mime, class) = mime_and_class_from_name("photo.JPG");
		assert_eq!(mime, "image/jpeg");
		assert_eq!(class, "image");
		let (mime, class) = mime_and_class_from_name("notes.txt");
		assert_eq!(mime, "text/plain");
		assert_eq!(class, "text");
	}

	#[test]
	fn sniffing_beats_extension() {
		let mut doc =
			FileDoc::new("image.bin", "", 0, String::new(), String::new(), String::new(), false)
				.unwrap();
		assert_eq!(doc.class, "files");
		let mut extractor = MetaExtractor::new();
		extractor.write(b"\x89PNG\r\n\x1a\nrest-of-the-file");
		extractor.apply(&mut doc);
		assert_eq!(doc.mime, "image/png");
		assert_eq!(doc.class, "image");
	}
}
