//! Binary index fixtures

use nozomi_dl::btree::B;

/// Encode one B-tree node
pub fn encode_node(keys: &[&[u8]], entries: &[(u64, u32)], children: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(keys.len() as u32).to_be_bytes());
    for key in keys {
        out.extend_from_slice(&(key.len() as u32).to_be_bytes());
        out.extend_from_slice(key);
    }
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (offset, length) in entries {
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&length.to_be_bytes());
    }
    for i in 0..=B {
        out.extend_from_slice(&children.get(i).copied().unwrap_or(0).to_be_bytes());
    }
    out
}

/// Encode a data-blob record: count, then identifiers
pub fn encode_ids_record(ids: &[u32]) -> Vec<u8> {
    let mut out = (ids.len() as u32).to_be_bytes().to_vec();
    for id in ids {
        out.extend_from_slice(&id.to_be_bytes());
    }
    out
}

/// Encode a `.nozomi` list
pub fn encode_nozomi(ids: &[u32]) -> Vec<u8> {
    ids.iter().flat_map(|id| id.to_be_bytes()).collect()
}

/// Item record script with one file per hash
pub fn gallery_record(id: u32, title: &str, hashes: &[&str]) -> String {
    let files: Vec<String> = hashes
        .iter()
        .enumerate()
        .map(|(i, hash)| {
            format!(r#"{{"name":"{:03}.jpg","hash":"{hash}","hasavif":0,"width":1,"height":1}}"#, i + 1)
        })
        .collect();
    format!(
        r#"var galleryinfo = {{"id":"{id}","title":"{title}","type":"doujinshi","language":"english","galleryurl":"/doujinshi/{id}.html","files":[{}],"tags":null}}"#,
        files.join(",")
    )
}
