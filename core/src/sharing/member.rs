//! Members of a sharing and the credentials pairing them.

use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
	#[serde(rename = "owner")]
	Owner,
	#[serde(rename = "mail-not-sent")]
	MailNotSent,
	#[serde(rename = "pending")]
	Pending,
	#[serde(rename = "ready")]
	Ready,
	#[serde(rename = "revoked")]
	Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
	pub status: MemberStatus,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub name: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub email: String,
	/// Base URL of the member's instance.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub instance: String,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub read_only: bool,
	/// End-to-end encryption key, delivered through the public-key
	/// endpoint.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub public_key: String,
}

/// An OAuth client registered on a peer instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthClient {
	pub client_id: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub client_secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessToken {
	pub access_token: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub refresh_token: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub scope: String,
}

/// The credentials pairing one peer: on the owner side, `credentials[i]`
/// pairs with `members[i+1]`; a recipient has exactly one entry, for the
/// owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
	/// Hex-encoded 16-byte key obfuscating document ids across the
	/// boundary.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub xor_key: String,
	/// State token for the invitation dance.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub state: String,
	/// The OAuth client the peer registered on us.
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub inbound_client_id: String,
	/// The OAuth client we registered on the peer.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client: Option<OAuthClient>,
	/// The token pair to reach the peer.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub access_token: Option<AccessToken>,
}

impl Credentials {
	pub fn new() -> Self {
		Self {
			xor_key: make_xor_key(),
			state: random_token(),
			..Default::default()
		}
	}

	pub fn bearer(&self) -> Option<&str> {
		self.access_token.as_ref().map(|t| t.access_token.as_str())
	}
}

/// Generates a fresh 16-byte XOR key, hex-encoded.
pub fn make_xor_key() -> String {
	let mut key = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut key);
	hex::encode(key)
}

pub fn random_token() -> String {
	let mut buf = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut buf);
	hex::encode(buf)
}

/// Maps a document id to its peer-side form: each hex character is
/// XOR-ed, nibble-wise, with the key; other characters pass through. The
/// operation is its own inverse.
pub fn xor_id(id: &str, xor_key: &str) -> String {
	let key = match hex::decode(xor_key) {
		Ok(key) if !key.is_empty() => key,
		_ => return id.to_owned(),
	};
	let mut out = String::with_capacity(id.len());
	let mut i = 0usize;
	for c in id.chars() {
		let nibble = match c {
			'0'..='9' => c as u8 - b'0',
			'a'..='f' => c as u8 - b'a' + 10,
			'A'..='F' => c as u8 - b'A' + 10,
			_ => {
				out.push(c);
				continue;
			}
		};
		let x = (nibble ^ key[i % key.len()]) & 0x0f;
		out.push(char::from_digit(x as u32, 16).expect("nibble is < 16"));
		i += 1;
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn xor_id_is_involutive() {
		let key = make_xor_key();
		let id = "2f85ac24f2104f5d8a8b4ff5c7a0e3b9";
		let xored = xor_id(id, &key);
		assert_ne!(xored, id);
		assert_eq!(xor_id(&xored, &key), id);
	}

	#[test]
	fn xor_id_skips_non_hex_chars() {
		let key = make_xor_key();
		let id = "2f85ac24-with-dashes";
		let xored = xor_id(id, &key);
		assert_eq!(xored.matches('-').count(), 2);
		assert_eq!(xor_id(&xored, &key), id);
	}
}
