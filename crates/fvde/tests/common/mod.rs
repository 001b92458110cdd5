// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Synthetic CoreStorage containers for the integration tests.
//!
//! The builder assembles complete physical volume images in memory:
//! validated headers, plaintext metadata with the volume group plist, an
//! encrypted metadata region (two copies) describing one logical volume,
//! a zlib-compressed keybag and the encrypted volume content itself. The
//! encryption side mirrors what the library decrypts.

use std::io::Write;

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use flate2::Compression;
use flate2::write::ZlibEncoder;
use sha2::{Digest, Sha256};
use xts_mode::{Xts128, get_tweak_default};

use fvde::checksum::weak_crc32;
use fvde::descriptors::SegmentDescriptor;
use fvde::encrypted_metadata::build as record_build;
use fvde::keybag::{build_kek_wrapped_volume_key_struct, build_passphrase_wrapped_kek_struct};
use fvde::metadata::build_type_0x0011_payload;
use fvde::metadata_block::frame_block;

pub const SECTOR_SIZE: u64 = 512;
pub const BLOCK_SIZE: u64 = 4096;
pub const SECTORS_PER_BLOCK: u64 = BLOCK_SIZE / SECTOR_SIZE;
pub const METADATA_SIZE: u32 = 16384;
pub const PV_IMAGE_SIZE: usize = 8 * 1024 * 1024;

pub const PASSWORD: &str = "fvde-TEST";
pub const WRONG_PASSWORD: &str = "xxxx";
pub const PBKDF2_ITERATIONS: u32 = 321;
pub const SERIAL_NUMBER: u32 = 0x53ae21f1;

pub const VOLUME_MASTER_KEY: [u8; 16] = [
    0x8c, 0x21, 0x5f, 0x03, 0xe1, 0x7a, 0x44, 0x9b, 0x3d, 0x76, 0x0a, 0xc8, 0x59, 0xe2, 0xb0, 0x4d,
];
pub const FAMILY_IDENTIFIER: [u8; 16] = [
    0xfa, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];
pub const LV_IDENTIFIER: [u8; 16] = [
    0x1b, 0xa5, 0xc2, 0xd0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc,
];
pub const LV_UUID_STRING: &str = "1ba5c2d0-1122-3344-5566-778899aabbcc";
pub const GROUP_IDENTIFIER: [u8; 16] = [
    0x60, 0x0d, 0xca, 0xfe, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb,
];
pub const KEY_DATA: [u8; 16] = [
    0x4e, 0x81, 0x27, 0xf3, 0xa0, 0x9c, 0x5d, 0x6e, 0x7f, 0x10, 0x21, 0x32, 0x43, 0x54, 0x65, 0x76,
];
pub const PBKDF2_SALT: [u8; 16] = [
    0x73, 0x61, 0x6c, 0x74, 0x5f, 0x73, 0x61, 0x6c, 0x74, 0x5f, 0x73, 0x61, 0x6c, 0x74, 0x21, 0x21,
];

/// Byte offset of the plaintext metadata (block 4)
pub const PLAINTEXT_METADATA_OFFSET: u64 = 4 * BLOCK_SIZE;
/// Block number of the primary encrypted metadata copy
pub const PRIMARY_METADATA_BLOCK: u64 = 20;
/// Block number of the secondary encrypted metadata copy
pub const SECONDARY_METADATA_BLOCK: u64 = 40;
/// Block the logical volume extents are measured from
pub const BASE_PHYSICAL_BLOCK: u64 = 64;

fn pv_identifier(pv_index: u16) -> [u8; 16] {
    let mut identifier = [0x50u8; 16];
    identifier[15] = pv_index as u8;
    identifier
}

fn pv_uuid_string(pv_index: u16) -> String {
    let id = pv_identifier(pv_index);
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        id[0], id[1], id[2], id[3], id[4], id[5], id[6], id[7], id[8], id[9], id[10], id[11],
        id[12], id[13], id[14], id[15],
    )
}

/// Description of the container to synthesize
pub struct ContainerSpec {
    pub number_of_pvs: u16,
    pub lv_size: u64,
    /// Extents with physical blocks relative to [`BASE_PHYSICAL_BLOCK`]
    pub segments: Vec<SegmentDescriptor>,
    pub corrupt_primary_metadata: bool,
    /// Store the logical volume content unencrypted
    pub plaintext_lv: bool,
    /// Embed the keybag in the encrypted metadata; when false the keybag
    /// must be supplied out of band
    pub embed_keybag: bool,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            number_of_pvs: 1,
            lv_size: 1024 * 1024,
            segments: vec![SegmentDescriptor {
                logical_block_number: 0,
                physical_volume_index: 0,
                physical_block_number: 0,
                number_of_blocks: (1024 * 1024) / BLOCK_SIZE,
            }],
            corrupt_primary_metadata: false,
            plaintext_lv: false,
            embed_keybag: true,
        }
    }
}

/// A built container plus the material needed to drive it
pub struct Container {
    pub images: Vec<Vec<u8>>,
    /// The logical volume content as reads should return it
    pub expected_content: Vec<u8>,
    /// The keybag document, also usable as an external `EncryptedRoot.plist`
    pub keybag_document: Vec<u8>,
}

impl Container {
    pub fn pool(&self) -> fvde::ReaderPool<std::io::Cursor<Vec<u8>>> {
        fvde::ReaderPool::new(
            self.images
                .iter()
                .cloned()
                .map(std::io::Cursor::new)
                .collect(),
        )
    }
}

pub fn build_container(spec: &ContainerSpec) -> Container {
    let mut images = vec![vec![0u8; PV_IMAGE_SIZE]; spec.number_of_pvs as usize];

    for pv_index in 0..spec.number_of_pvs {
        let header = build_volume_header(pv_index);
        images[pv_index as usize][..512].copy_from_slice(&header);
    }
    write_plaintext_metadata(&mut images[0], spec.number_of_pvs);

    let keybag_document = build_keybag_plist();
    let region = build_encrypted_metadata_region(spec, &keybag_document);
    let encrypted_region = encrypt_metadata_region(&region, 0);
    let primary_offset = (PRIMARY_METADATA_BLOCK * BLOCK_SIZE) as usize;
    let secondary_offset = (SECONDARY_METADATA_BLOCK * BLOCK_SIZE) as usize;
    images[0][primary_offset..primary_offset + encrypted_region.len()]
        .copy_from_slice(&encrypted_region);
    images[0][secondary_offset..secondary_offset + encrypted_region.len()]
        .copy_from_slice(&encrypted_region);
    if spec.corrupt_primary_metadata {
        for byte in &mut images[0][primary_offset + 100..primary_offset + 164] {
            *byte ^= 0xff;
        }
    }
    let expected_content = write_logical_volume_content(&mut images, spec);

    Container {
        images,
        expected_content,
        keybag_document,
    }
}

fn build_volume_header(pv_index: u16) -> [u8; 512] {
    let mut data = [0u8; 512];
    data[4..8].copy_from_slice(&0xffffffffu32.to_le_bytes());
    data[8..10].copy_from_slice(&1u16.to_le_bytes());
    data[10..12].copy_from_slice(&0x0010u16.to_le_bytes());
    data[12..16].copy_from_slice(&SERIAL_NUMBER.to_le_bytes());
    data[48..52].copy_from_slice(&(SECTOR_SIZE as u32).to_le_bytes());
    data[64..72].copy_from_slice(&(PV_IMAGE_SIZE as u64).to_le_bytes());
    data[88..90].copy_from_slice(b"CS");
    data[90..94].copy_from_slice(&1u32.to_le_bytes());
    data[96..100].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
    data[100..104].copy_from_slice(&METADATA_SIZE.to_le_bytes());
    for (index, block_number) in [4u64, 8, 12, 16].iter().enumerate() {
        let start = 104 + index * 8;
        data[start..start + 8].copy_from_slice(&block_number.to_le_bytes());
    }
    data[168..172].copy_from_slice(&16u32.to_le_bytes());
    data[172..176].copy_from_slice(&2u32.to_le_bytes());
    data[176..192].copy_from_slice(&KEY_DATA);
    data[304..320].copy_from_slice(&pv_identifier(pv_index));
    data[320..336].copy_from_slice(&GROUP_IDENTIFIER);

    let checksum = weak_crc32(&data[8..], 0xffffffff);
    data[0..4].copy_from_slice(&checksum.to_le_bytes());
    data
}

fn write_plaintext_metadata(image: &mut [u8], number_of_pvs: u16) {
    let members: String = (0..number_of_pvs)
        .map(|pv_index| format!("<string>{}</string>", pv_uuid_string(pv_index)))
        .collect();
    let group_plist = format!(
        "<dict>\
            <key>com.apple.corestorage.lvg.uuid</key>\
            <string>600dcafe-0011-2233-4455-66778899aabb</string>\
            <key>com.apple.corestorage.lvg.name</key>\
            <string>FixtureGroup</string>\
            <key>com.apple.corestorage.lvg.physicalVolumes</key>\
            <array>{members}</array>\
        </dict>"
    );
    let region_blocks = region_size() / BLOCK_SIZE;
    let payload = build_type_0x0011_payload(
        METADATA_SIZE,
        0,
        region_blocks,
        PRIMARY_METADATA_BLOCK,
        SECONDARY_METADATA_BLOCK,
        group_plist.as_bytes(),
    );
    // Four redundant copies; the first carries the newest transaction.
    for (index, metadata_block) in [4u64, 8, 12, 16].iter().enumerate() {
        let transaction = 4 - index as u64;
        let block = frame_block(0x0011, SERIAL_NUMBER, transaction, 0, 0, &payload);
        let offset = (metadata_block * BLOCK_SIZE) as usize;
        image[offset..offset + block.len()].copy_from_slice(&block);
    }
}

/// Size in bytes of the encrypted metadata region (4 framed blocks)
fn region_size() -> u64 {
    4 * 8192
}

fn build_encrypted_metadata_region(spec: &ContainerSpec, keybag_document: &[u8]) -> Vec<u8> {
    let lv_payload = record_build::type_0x001a_payload(
        &LV_IDENTIFIER,
        &FAMILY_IDENTIFIER,
        spec.lv_size,
        "FixtureLV",
    );
    let table_payload = record_build::type_0x0305_payload(100, BASE_PHYSICAL_BLOCK, 200);
    let entries_payload = record_build::type_0x0505_payload(200, &spec.segments);

    let family_payload = if spec.embed_keybag {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(keybag_document).unwrap();
        let compressed = encoder.finish().unwrap();
        record_build::type_0x0019_payload(
            300,
            &FAMILY_IDENTIFIER,
            1,
            keybag_document.len() as u32,
            &compressed,
        )
    } else {
        record_build::type_0x0019_payload(300, &FAMILY_IDENTIFIER, 0, 0, &[])
    };

    let mut region = Vec::with_capacity(region_size() as usize);
    region.extend_from_slice(&frame_block(0x001a, SERIAL_NUMBER, 1, 100, 0, &lv_payload));
    region.extend_from_slice(&frame_block(0x0305, SERIAL_NUMBER, 1, 150, 1, &table_payload));
    region.extend_from_slice(&frame_block(0x0505, SERIAL_NUMBER, 1, 200, 2, &entries_payload));
    region.extend_from_slice(&frame_block(0x0019, SERIAL_NUMBER, 1, 300, 3, &family_payload));
    region
}

fn encrypt_metadata_region(region: &[u8], pv_index: u16) -> Vec<u8> {
    let cipher = Xts128::new(
        Aes128::new(GenericArray::from_slice(&KEY_DATA)),
        Aes128::new(GenericArray::from_slice(&pv_identifier(pv_index))),
    );
    let mut encrypted = region.to_vec();
    for (block_index, block) in encrypted.chunks_exact_mut(8192).enumerate() {
        cipher.encrypt_sector(block, get_tweak_default(block_index as u128));
    }
    encrypted
}

fn build_keybag_plist() -> Vec<u8> {
    let mut kek = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<Sha256>(PASSWORD.as_bytes(), &PBKDF2_SALT, PBKDF2_ITERATIONS, &mut kek);

    // Intermediate KEK: password KEK wraps it, it wraps the master key.
    let intermediate: [u8; 16] = {
        let digest = Sha256::digest(b"fixture intermediate kek");
        digest[..16].try_into().unwrap()
    };
    let wrapped_kek = aes_key_wrap(&kek, &intermediate);
    let wrapped_vmk = aes_key_wrap(&intermediate, &VOLUME_MASTER_KEY);

    let kek_struct =
        build_passphrase_wrapped_kek_struct(PBKDF2_ITERATIONS, &PBKDF2_SALT, &wrapped_kek);
    let vmk_struct = build_kek_wrapped_volume_key_struct(&wrapped_vmk);

    format!(
        "<dict>\
            <key>com.apple.corestorage.lvf.uuid</key>\
            <string>fa010203-0405-0607-0809-0a0b0c0d0e0f</string>\
            <key>CryptoUsers</key>\
            <array><dict>\
                <key>UserIdentifier</key>\
                <string>feedface-0000-1111-2222-333344445555</string>\
                <key>UserType</key>\
                <integer>1</integer>\
                <key>PassphraseWrappedKEKStruct</key>\
                <data>{}</data>\
            </dict></array>\
            <key>WrappedVolumeKeys</key>\
            <array><dict>\
                <key>KEKWrappedVolumeKeyStruct</key>\
                <data>{}</data>\
            </dict></array>\
        </dict>",
        BASE64.encode(kek_struct),
        BASE64.encode(vmk_struct),
    )
    .into_bytes()
}

/// Forward RFC 3394 key wrap for a 16-byte payload
pub fn aes_key_wrap(key: &[u8; 16], plain: &[u8; 16]) -> [u8; 24] {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut vector = [0xa6u8; 8];
    let mut blocks = *plain;
    let mut block_data = [0u8; 16];

    for round_index in 0..=5u64 {
        for block_index in 1..=2u64 {
            let block_offset = (block_index as usize - 1) * 8;
            block_data[..8].copy_from_slice(&vector);
            block_data[8..].copy_from_slice(&blocks[block_offset..block_offset + 8]);
            cipher.encrypt_block(GenericArray::from_mut_slice(&mut block_data));

            let counter = round_index * 2 + block_index;
            vector.copy_from_slice(&block_data[..8]);
            for (byte, counter_byte) in vector.iter_mut().zip(counter.to_be_bytes()) {
                *byte ^= counter_byte;
            }
            blocks[block_offset..block_offset + 8].copy_from_slice(&block_data[8..]);
        }
    }
    let mut wrapped = [0u8; 24];
    wrapped[..8].copy_from_slice(&vector);
    wrapped[8..].copy_from_slice(&blocks);
    wrapped
}

/// Deterministic content byte for logical offset `offset`
fn content_byte(offset: u64) -> u8 {
    (offset
        .wrapping_mul(0x9e3779b97f4a7c15)
        .rotate_left(17)
        .wrapping_add(offset >> 9)) as u8
}

/// Fills the logical volume image and encrypts the mapped extents into the
/// physical volume images; returns the plaintext a reader should observe.
fn write_logical_volume_content(images: &mut [Vec<u8>], spec: &ContainerSpec) -> Vec<u8> {
    let mut content = vec![0u8; spec.lv_size as usize];
    for (offset, byte) in content.iter_mut().enumerate() {
        *byte = content_byte(offset as u64);
    }
    // Disk-label signature probed at unlock (HFS+ at offset 1024), plus
    // recognizable bytes at the offsets the tests read back.
    content[0..4].copy_from_slice(&[0x48, 0x2b, 0x00, 0x04]);
    content[0x200..0x208].copy_from_slice(&[0x42, 0x6c, 0x6b, 0x48, 0x00, 0x00, 0x00, 0x01]);
    content[1024..1028].copy_from_slice(&[0x48, 0x2b, 0x00, 0x04]);

    // Zero everything no extent maps; those regions read as sparse.
    let mut mapped = vec![false; spec.lv_size.div_ceil(SECTOR_SIZE) as usize];
    for segment in &spec.segments {
        let first_sector = segment.logical_block_number * SECTORS_PER_BLOCK;
        let sector_count = segment.number_of_blocks * SECTORS_PER_BLOCK;
        for sector in first_sector..first_sector + sector_count {
            if let Some(flag) = mapped.get_mut(sector as usize) {
                *flag = true;
            }
        }
    }
    for (sector, flag) in mapped.iter().enumerate() {
        if !flag {
            let start = sector * SECTOR_SIZE as usize;
            let end = (start + SECTOR_SIZE as usize).min(content.len());
            content[start..end].fill(0);
        }
    }
    let tweak_key = {
        let mut hasher = Sha256::new();
        hasher.update(VOLUME_MASTER_KEY);
        hasher.update(FAMILY_IDENTIFIER);
        let digest = hasher.finalize();
        let mut tweak_key = [0u8; 16];
        tweak_key.copy_from_slice(&digest[..16]);
        tweak_key
    };
    let cipher = Xts128::new(
        Aes128::new(GenericArray::from_slice(&VOLUME_MASTER_KEY)),
        Aes128::new(GenericArray::from_slice(&tweak_key)),
    );
    for segment in &spec.segments {
        let first_sector = segment.logical_block_number * SECTORS_PER_BLOCK;
        let sector_count = segment.number_of_blocks * SECTORS_PER_BLOCK;
        let physical_byte =
            (BASE_PHYSICAL_BLOCK + segment.physical_block_number) * BLOCK_SIZE;
        let image = &mut images[segment.physical_volume_index as usize];

        for sector_in_segment in 0..sector_count {
            let logical_sector = first_sector + sector_in_segment;
            let logical_start = (logical_sector * SECTOR_SIZE) as usize;
            if logical_start >= content.len() {
                break;
            }
            let mut sector = [0u8; SECTOR_SIZE as usize];
            let end = (logical_start + SECTOR_SIZE as usize).min(content.len());
            sector[..end - logical_start].copy_from_slice(&content[logical_start..end]);

            if !spec.plaintext_lv {
                cipher.encrypt_sector(&mut sector, get_tweak_default(logical_sector as u128));
            }
            let target = (physical_byte + sector_in_segment * SECTOR_SIZE) as usize;
            image[target..target + SECTOR_SIZE as usize].copy_from_slice(&sector);
        }
    }
    content
}
