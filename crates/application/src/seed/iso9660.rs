//! Minimal ISO9660 writer for cloud-init seed images
//!
//! Writes a single-directory `CIDATA` volume holding exactly `meta-data` and
//! `user-data`. Identifiers are written verbatim (lowercase, hyphenated) —
//! outside the strict ECMA-119 d-character set, but what the Linux iso9660
//! driver and cloud-init's NoCloud datasource expect to find. All timestamp
//! fields are left unspecified so identical inputs produce identical bytes.

const SECTOR: usize = 2048;

/// Sector numbers of the fixed layout: system area, PVD, terminator, the two
/// path tables, the root directory, then file extents.
const PVD_SECTOR: usize = 16;
const TERMINATOR_SECTOR: usize = 17;
const PATH_TABLE_L_SECTOR: usize = 18;
const PATH_TABLE_M_SECTOR: usize = 19;
const ROOT_DIR_SECTOR: usize = 20;
const FIRST_FILE_SECTOR: usize = 21;

/// Build the seed image from the two cloud-init files.
pub fn build_cidata_iso(meta_data: &[u8], user_data: &[u8]) -> Vec<u8> {
    // Root directory entries must be sorted by identifier; "meta-data"
    // orders before "user-data".
    let files: [(&str, &[u8]); 2] = [("meta-data", meta_data), ("user-data", user_data)];

    let mut extents: Vec<(usize, usize)> = Vec::new(); // (first sector, sectors)
    let mut next = FIRST_FILE_SECTOR;
    for (_, content) in &files {
        let sectors = content.len().div_ceil(SECTOR).max(1);
        extents.push((next, sectors));
        next += sectors;
    }
    let total_sectors = next;

    let mut image = vec![0u8; total_sectors * SECTOR];

    write_pvd(
        &mut image[PVD_SECTOR * SECTOR..(PVD_SECTOR + 1) * SECTOR],
        total_sectors as u32,
    );

    // Volume descriptor set terminator
    {
        let terminator = &mut image[TERMINATOR_SECTOR * SECTOR..];
        terminator[0] = 255;
        terminator[1..6].copy_from_slice(b"CD001");
        terminator[6] = 1;
    }

    write_path_table(
        &mut image[PATH_TABLE_L_SECTOR * SECTOR..],
        ROOT_DIR_SECTOR as u32,
        false,
    );
    write_path_table(
        &mut image[PATH_TABLE_M_SECTOR * SECTOR..],
        ROOT_DIR_SECTOR as u32,
        true,
    );

    // Root directory: ".", "..", then the files
    {
        let mut offset = ROOT_DIR_SECTOR * SECTOR;
        offset += write_dir_record(
            &mut image[offset..],
            &[0x00],
            ROOT_DIR_SECTOR as u32,
            SECTOR as u32,
            true,
        );
        offset += write_dir_record(
            &mut image[offset..],
            &[0x01],
            ROOT_DIR_SECTOR as u32,
            SECTOR as u32,
            true,
        );
        for ((name, content), (lba, _)) in files.iter().zip(&extents) {
            offset += write_dir_record(
                &mut image[offset..],
                name.as_bytes(),
                *lba as u32,
                content.len() as u32,
                false,
            );
        }
    }

    for ((_, content), (lba, _)) in files.iter().zip(&extents) {
        let start = lba * SECTOR;
        image[start..start + content.len()].copy_from_slice(content);
    }

    image
}

/// Primary volume descriptor.
fn write_pvd(pvd: &mut [u8], total_sectors: u32) {
    pvd[0] = 1;
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1;
    fill_spaces(&mut pvd[8..40]); // system identifier
    fill_spaces(&mut pvd[40..72]); // volume identifier
    pvd[40..46].copy_from_slice(b"CIDATA");
    both_u32(&mut pvd[80..88], total_sectors); // volume space size
    both_u16(&mut pvd[120..124], 1); // volume set size
    both_u16(&mut pvd[124..128], 1); // volume sequence number
    both_u16(&mut pvd[128..132], SECTOR as u16); // logical block size
    both_u32(&mut pvd[132..140], path_table_len() as u32);
    pvd[140..144].copy_from_slice(&(PATH_TABLE_L_SECTOR as u32).to_le_bytes());
    pvd[148..152].copy_from_slice(&(PATH_TABLE_M_SECTOR as u32).to_be_bytes());

    // Root directory record, embedded at offset 156
    let mut root = [0u8; 34];
    write_dir_record(&mut root, &[0x00], ROOT_DIR_SECTOR as u32, SECTOR as u32, true);
    pvd[156..190].copy_from_slice(&root);

    fill_spaces(&mut pvd[190..318]); // volume set identifier
    fill_spaces(&mut pvd[318..446]); // publisher
    fill_spaces(&mut pvd[446..574]); // data preparer
    fill_spaces(&mut pvd[574..702]); // application
    fill_spaces(&mut pvd[702..739]); // copyright file
    fill_spaces(&mut pvd[739..776]); // abstract file
    fill_spaces(&mut pvd[776..813]); // bibliographic file

    // Volume timestamps: all-zero digits mean "not specified", which keeps
    // the image content-addressed by its two files alone.
    for range in [813..830, 830..847, 847..864, 864..881] {
        pvd[range].copy_from_slice(b"0000000000000000\0");
    }
    pvd[881] = 1; // file structure version
}

/// One directory record; returns the record length written.
fn write_dir_record(buf: &mut [u8], identifier: &[u8], lba: u32, size: u32, dir: bool) -> usize {
    let id_len = identifier.len();
    let mut len = 33 + id_len;
    if len % 2 != 0 {
        len += 1; // pad to even length
    }
    buf[0] = len as u8;
    both_u32(&mut buf[2..10], lba);
    both_u32(&mut buf[10..18], size);
    // bytes 18..25: recording timestamp, left unspecified
    buf[25] = if dir { 0x02 } else { 0x00 };
    both_u16(&mut buf[28..32], 1); // volume sequence number
    buf[32] = id_len as u8;
    buf[33..33 + id_len].copy_from_slice(identifier);
    len
}

/// Single-entry path table (just the root directory).
fn write_path_table(buf: &mut [u8], root_lba: u32, big_endian: bool) {
    buf[0] = 1; // identifier length
    let lba = if big_endian {
        root_lba.to_be_bytes()
    } else {
        root_lba.to_le_bytes()
    };
    buf[2..6].copy_from_slice(&lba);
    let parent: u16 = 1;
    let parent_bytes = if big_endian {
        parent.to_be_bytes()
    } else {
        parent.to_le_bytes()
    };
    buf[6..8].copy_from_slice(&parent_bytes);
    // byte 8: root identifier 0x00, byte 9: pad
}

fn path_table_len() -> usize {
    10
}

/// Both-byte-order 32-bit field (LSB first, then MSB).
fn both_u32(buf: &mut [u8], value: u32) {
    buf[0..4].copy_from_slice(&value.to_le_bytes());
    buf[4..8].copy_from_slice(&value.to_be_bytes());
}

/// Both-byte-order 16-bit field.
fn both_u16(buf: &mut [u8], value: u16) {
    buf[0..2].copy_from_slice(&value.to_le_bytes());
    buf[2..4].copy_from_slice(&value.to_be_bytes());
}

fn fill_spaces(buf: &mut [u8]) {
    buf.fill(b' ');
}
