use crate::android::chunk::{BinaryReader, ChunkHeader, ChunkType, RES_XML_RESOURCE_MAP_TYPE};
use crate::android::string_pool::StringPool;
use log::{debug, warn};

/// Resource ids aligned with the low indices of the string pool.
///
/// Entry `i` is the framework attribute id of string `i`, which is how Android resolves
/// attribute names regardless of what the string itself says.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceMap {
    ids: Vec<u32>,
}

impl ResourceMap {
    pub fn parse(data: &[u8], header: &ChunkHeader) -> Self {
        let end = header.end().min(data.len());
        let mut reader = BinaryReader::at(data, header.body_start());
        let mut ids = Vec::new();
        while reader.position() + 4 <= end {
            match reader.read_u32() {
                Ok(id) => ids.push(id),
                Err(_) => break,
            }
        }
        ResourceMap { ids }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn get(&self, idx: u32) -> Option<u32> {
        self.ids.get(idx as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Find the resource map following `pool` and the offset the element stream starts at.
///
/// The pool's declared end is trusted when a usable header sits there. Otherwise the bytes
/// after the string data are searched for the resource map signature, and failing that the
/// element stream is assumed to start right after the string data.
pub fn locate_after_pool(data: &[u8], pool: &StringPool) -> (ResourceMap, usize) {
    let declared_end = pool.declared_end();
    if let Ok(header) = ChunkHeader::parse(data, declared_end) {
        if header.is_plausible() && header.fits(data.len()) {
            if header.kind() == ChunkType::ResourceMap {
                return (ResourceMap::parse(data, &header), header.end());
            }
            debug!("[axml] no resource map at 0x{declared_end:x}; elements start there");
            return (ResourceMap::default(), declared_end);
        }
    }

    let strings_end = pool.strings_end().min(data.len());
    warn!(
        "[axml] string pool end 0x{declared_end:x} holds no chunk; scanning from 0x{strings_end:x}"
    );
    let signature = RES_XML_RESOURCE_MAP_TYPE.to_le_bytes();
    let found = data[strings_end..]
        .windows(signature.len())
        .enumerate()
        .filter(|(_, window)| *window == signature)
        .map(|(relative, _)| strings_end + relative)
        .find_map(|pos| {
            ChunkHeader::parse(data, pos)
                .ok()
                .filter(|header| header.is_plausible() && header.fits(data.len()))
        });

    match found {
        Some(header) => (ResourceMap::parse(data, &header), header.end()),
        None => (ResourceMap::default(), strings_end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::chunk::{begin_chunk, finalize_chunk, write_u32};
    use crate::android::string_pool::StringPoolBuilder;

    fn map_chunk(ids: &[u32]) -> Vec<u8> {
        let mut buf = Vec::new();
        let start = begin_chunk(&mut buf, RES_XML_RESOURCE_MAP_TYPE, 8);
        for id in ids {
            write_u32(&mut buf, *id);
        }
        finalize_chunk(&mut buf, start);
        buf
    }

    fn pool_document(trailer: &[u8]) -> (Vec<u8>, StringPool) {
        let mut builder = StringPoolBuilder::new();
        builder.intern("name");
        builder.intern("label");
        let mut data = builder.to_chunk();
        data.extend_from_slice(trailer);
        let header = ChunkHeader::parse(&data, 0).unwrap();
        let pool = StringPool::parse(&data, &header);
        (data, pool)
    }

    #[test]
    fn map_at_declared_pool_end() {
        let (data, pool) = pool_document(&map_chunk(&[0x0101_0003, 0x0101_0001]));
        let (map, next) = locate_after_pool(&data, &pool);
        assert_eq!(map.ids(), &[0x0101_0003, 0x0101_0001]);
        assert_eq!(map.get(1), Some(0x0101_0001));
        assert_eq!(next, data.len());
    }

    #[test]
    fn element_at_declared_end_means_no_map() {
        let end_element = [0x03, 0x01, 0x10, 0x00, 0x18, 0x00, 0x00, 0x00, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut trailer = end_element.to_vec();
        trailer.extend_from_slice(&[0u8; 8]);
        let (data, pool) = pool_document(&trailer);
        let (map, next) = locate_after_pool(&data, &pool);
        assert!(map.is_empty());
        assert_eq!(next, pool.declared_end());
    }

    #[test]
    fn inflated_pool_size_falls_back_to_signature_scan() {
        let (mut data, _) = pool_document(&map_chunk(&[0x0101_0003]));
        data[4..8].copy_from_slice(&0x4000u32.to_le_bytes());
        let header = ChunkHeader::parse(&data, 0).unwrap();
        let pool = StringPool::parse(&data, &header);
        let (map, next) = locate_after_pool(&data, &pool);
        assert_eq!(map.ids(), &[0x0101_0003]);
        assert_eq!(next, data.len());
    }
}
