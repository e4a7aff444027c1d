//! Per-process two-level paging
//!
//! A process owns a page directory of 1024 entries; each entry may
//! point at a 1024-entry page table. Directory and table pages live in
//! pool frames themselves. An entry packs a frame id with its flag
//! bits. Virtual addresses split as directory index (31..22), table
//! index (21..12), and page offset (11..0).

use bitflags::bitflags;

use super::frame::{FrameId, FramePool, PAGE_SIZE};

bitflags! {
    /// Leaf and directory entry attribute bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        /// Mapping is live
        const PRESENT = 1 << 0;
        /// Stores are allowed
        const WRITABLE = 1 << 1;
        /// User-mode code may touch the page
        const USER = 1 << 2;
        /// The page has been read or written
        const ACCESSED = 1 << 3;
    }
}

/// Entries pack `frame_id << 12 | flags`
const FRAME_SHIFT: u32 = 12;

/// Memory operation result; the error is the faulting virtual address
pub type MemResult<T> = std::result::Result<T, u32>;

fn dir_index(va: u32) -> u32 {
    (va >> 22) & 0x3FF
}

fn table_index(va: u32) -> u32 {
    (va >> 12) & 0x3FF
}

fn page_offset(va: u32) -> u32 {
    va & 0xFFF
}

/// A process's address-space mapping
///
/// Holds only the directory frame id; all state lives in pool frames
/// so that fork can walk and duplicate it.
#[derive(Debug, Clone, Copy)]
pub struct PageTable {
    dir: FrameId,
}

impl PageTable {
    /// Allocates an empty directory
    ///
    /// The directory frame is returned so the caller can record
    /// ownership; table frames surface the same way from [`Self::map`].
    pub fn new(pool: &mut FramePool) -> crate::error::Result<(Self, FrameId)> {
        let dir = pool.alloc()?;
        Ok((PageTable { dir }, dir))
    }

    /// The directory frame id
    pub fn dir_frame(&self) -> FrameId {
        self.dir
    }

    fn read_entry(pool: &FramePool, frame: FrameId, index: u32) -> u32 {
        let bytes = pool.read(frame, index * 4, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn write_entry(pool: &mut FramePool, frame: FrameId, index: u32, entry: u32) {
        pool.write(frame, index * 4, &entry.to_le_bytes());
    }

    /// Installs a leaf mapping for the page containing `va`
    ///
    /// Lazily allocates the page-table frame for the directory slot;
    /// when one is created its frame id is returned so the caller can
    /// take ownership.
    pub fn map(
        &self,
        pool: &mut FramePool,
        va: u32,
        frame: FrameId,
        flags: PteFlags,
    ) -> crate::error::Result<Option<FrameId>> {
        let di = dir_index(va);
        let dir_entry = Self::read_entry(pool, self.dir, di);
        let (table, created) = if PteFlags::from_bits_truncate(dir_entry).contains(PteFlags::PRESENT)
        {
            (dir_entry >> FRAME_SHIFT, None)
        } else {
            let t = pool.alloc()?;
            Self::write_entry(
                pool,
                self.dir,
                di,
                (t << FRAME_SHIFT) | (PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER).bits(),
            );
            (t, Some(t))
        };
        Self::write_entry(
            pool,
            table,
            table_index(va),
            (frame << FRAME_SHIFT) | (flags | PteFlags::PRESENT).bits(),
        );
        Ok(created)
    }

    /// Clears the leaf mapping for the page containing `va`
    pub fn unmap(&self, pool: &mut FramePool, va: u32) {
        let dir_entry = Self::read_entry(pool, self.dir, dir_index(va));
        if PteFlags::from_bits_truncate(dir_entry).contains(PteFlags::PRESENT) {
            Self::write_entry(pool, dir_entry >> FRAME_SHIFT, table_index(va), 0);
        }
    }

    /// Walks both levels, returning the backing frame and page offset
    pub fn translate(&self, pool: &FramePool, va: u32) -> MemResult<(FrameId, u32)> {
        let dir_entry = Self::read_entry(pool, self.dir, dir_index(va));
        if !PteFlags::from_bits_truncate(dir_entry).contains(PteFlags::PRESENT) {
            return Err(va);
        }
        let table = dir_entry >> FRAME_SHIFT;
        let leaf = Self::read_entry(pool, table, table_index(va));
        if !PteFlags::from_bits_truncate(leaf).contains(PteFlags::PRESENT) {
            return Err(va);
        }
        Ok((leaf >> FRAME_SHIFT, page_offset(va)))
    }

    /// Flags of the leaf mapping the page containing `va`, if present
    pub fn flags_of(&self, pool: &FramePool, va: u32) -> Option<PteFlags> {
        self.translate(pool, va).ok().map(|_| {
            let dir_entry = Self::read_entry(pool, self.dir, dir_index(va));
            let leaf = Self::read_entry(pool, dir_entry >> FRAME_SHIFT, table_index(va));
            PteFlags::from_bits_truncate(leaf)
        })
    }

    /// Lists every present leaf as `(va, frame)`; fork walks this
    pub fn mappings(&self, pool: &FramePool) -> Vec<(u32, FrameId)> {
        let mut out = Vec::new();
        for di in 0..1024u32 {
            let dir_entry = Self::read_entry(pool, self.dir, di);
            if !PteFlags::from_bits_truncate(dir_entry).contains(PteFlags::PRESENT) {
                continue;
            }
            let table = dir_entry >> FRAME_SHIFT;
            for ti in 0..1024u32 {
                let leaf = Self::read_entry(pool, table, ti);
                if PteFlags::from_bits_truncate(leaf).contains(PteFlags::PRESENT) {
                    out.push(((di << 22) | (ti << 12), leaf >> FRAME_SHIFT));
                }
            }
        }
        out
    }

    fn touch(&self, pool: &mut FramePool, va: u32) {
        let dir_entry = Self::read_entry(pool, self.dir, dir_index(va));
        if PteFlags::from_bits_truncate(dir_entry).contains(PteFlags::PRESENT) {
            let table = dir_entry >> FRAME_SHIFT;
            let ti = table_index(va);
            let leaf = Self::read_entry(pool, table, ti);
            if PteFlags::from_bits_truncate(leaf).contains(PteFlags::PRESENT) {
                Self::write_entry(pool, table, ti, leaf | PteFlags::ACCESSED.bits());
            }
        }
    }

    // -------------------------------------------------------------------
    // Convenience operations over translated addresses
    // -------------------------------------------------------------------

    /// Reads bytes across page boundaries
    pub fn read_bytes(&self, pool: &mut FramePool, va: u32, buf: &mut [u8]) -> MemResult<()> {
        let mut done = 0u32;
        let len = buf.len() as u32;
        while done < len {
            let addr = va + done;
            let (frame, off) = self.translate(pool, addr)?;
            self.touch(pool, addr);
            let chunk = (PAGE_SIZE - off).min(len - done);
            buf[done as usize..(done + chunk) as usize]
                .copy_from_slice(pool.read(frame, off, chunk));
            done += chunk;
        }
        Ok(())
    }

    /// Writes bytes across page boundaries; read-only pages fault
    pub fn write_bytes(&self, pool: &mut FramePool, va: u32, bytes: &[u8]) -> MemResult<()> {
        let mut done = 0u32;
        let len = bytes.len() as u32;
        while done < len {
            let addr = va + done;
            let (frame, off) = self.translate(pool, addr)?;
            let writable = self
                .flags_of(pool, addr)
                .is_some_and(|f| f.contains(PteFlags::WRITABLE));
            if !writable {
                return Err(addr);
            }
            self.touch(pool, addr);
            let chunk = (PAGE_SIZE - off).min(len - done);
            pool.write(frame, off, &bytes[done as usize..(done + chunk) as usize]);
            done += chunk;
        }
        Ok(())
    }

    /// Reads one byte
    pub fn read_u8(&self, pool: &mut FramePool, va: u32) -> MemResult<u8> {
        let mut b = [0u8; 1];
        self.read_bytes(pool, va, &mut b)?;
        Ok(b[0])
    }

    /// Reads a little-endian 32-bit word
    pub fn read_u32(&self, pool: &mut FramePool, va: u32) -> MemResult<u32> {
        let mut b = [0u8; 4];
        self.read_bytes(pool, va, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// Reads a little-endian 64-bit word
    pub fn read_u64(&self, pool: &mut FramePool, va: u32) -> MemResult<u64> {
        let mut b = [0u8; 8];
        self.read_bytes(pool, va, &mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    /// Writes one byte
    pub fn write_u8(&self, pool: &mut FramePool, va: u32, v: u8) -> MemResult<()> {
        self.write_bytes(pool, va, &[v])
    }

    /// Writes a little-endian 32-bit word
    pub fn write_u32(&self, pool: &mut FramePool, va: u32, v: u32) -> MemResult<()> {
        self.write_bytes(pool, va, &v.to_le_bytes())
    }

    /// Writes a little-endian 64-bit word
    pub fn write_u64(&self, pool: &mut FramePool, va: u32, v: u64) -> MemResult<()> {
        self.write_bytes(pool, va, &v.to_le_bytes())
    }

    /// Fills `count` bytes with `value`
    pub fn memset(&self, pool: &mut FramePool, va: u32, value: u8, count: u32) -> MemResult<()> {
        let chunk = vec![value; count as usize];
        self.write_bytes(pool, va, &chunk)
    }

    /// Compares two guest ranges; returns the first difference as
    /// `left - right`, or 0 when equal
    pub fn memcmp(&self, pool: &mut FramePool, a: u32, b: u32, count: u32) -> MemResult<i32> {
        for k in 0..count {
            let x = self.read_u8(pool, a + k)?;
            let y = self.read_u8(pool, b + k)?;
            if x != y {
                return Ok(x as i32 - y as i32);
            }
        }
        Ok(0)
    }

    /// Reads a NUL-terminated guest string
    pub fn get_str(&self, pool: &mut FramePool, va: u32) -> MemResult<String> {
        let mut out = Vec::new();
        let mut addr = va;
        loop {
            let b = self.read_u8(pool, addr)?;
            if b == 0 {
                return Ok(String::from_utf8_lossy(&out).into_owned());
            }
            out.push(b);
            addr = addr.wrapping_add(1);
        }
    }

    /// Writes a guest string with its NUL terminator
    pub fn set_str(&self, pool: &mut FramePool, va: u32, s: &str) -> MemResult<()> {
        self.write_bytes(pool, va, s.as_bytes())?;
        self.write_u8(pool, va + s.len() as u32, 0)
    }

    /// Pushes one stack slot; the stack grows downward
    pub fn push(&self, pool: &mut FramePool, sp: &mut u32, value: u64) -> MemResult<()> {
        *sp = sp.wrapping_sub(8);
        self.write_u64(pool, *sp, value)
    }

    /// Pops one stack slot
    pub fn pop(&self, pool: &mut FramePool, sp: &mut u32) -> MemResult<u64> {
        let v = self.read_u64(pool, *sp)?;
        *sp = sp.wrapping_add(8);
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (FramePool, PageTable) {
        let mut pool = FramePool::new(64);
        let (pt, _) = PageTable::new(&mut pool).unwrap();
        (pool, pt)
    }

    #[test]
    fn test_map_translate_unmap() {
        let (mut pool, pt) = setup();
        let frame = pool.alloc().unwrap();
        pt.map(
            &mut pool,
            0xF000_0000,
            frame,
            PteFlags::WRITABLE | PteFlags::USER,
        )
        .unwrap();
        let (f, off) = pt.translate(&pool, 0xF000_0123).unwrap();
        assert_eq!(f, frame);
        assert_eq!(off, 0x123);
        pt.unmap(&mut pool, 0xF000_0000);
        assert_eq!(pt.translate(&pool, 0xF000_0123), Err(0xF000_0123));
    }

    #[test]
    fn test_unmapped_address_faults() {
        let (pool, pt) = setup();
        assert_eq!(pt.translate(&pool, 0xD000_0000), Err(0xD000_0000));
    }

    #[test]
    fn test_lazy_table_allocation() {
        let (mut pool, pt) = setup();
        let before = pool.free_count();
        let frame = pool.alloc().unwrap();
        let created = pt
            .map(&mut pool, 0xC000_0000, frame, PteFlags::USER)
            .unwrap();
        assert!(created.is_some());
        // mapping a second page in the same 4MB window reuses the table
        let frame2 = pool.alloc().unwrap();
        let again = pt
            .map(&mut pool, 0xC000_1000, frame2, PteFlags::USER)
            .unwrap();
        assert!(again.is_none());
        assert_eq!(pool.free_count(), before - 3);
    }

    #[test]
    fn test_cross_page_write_read() {
        let (mut pool, pt) = setup();
        for page in 0..2u32 {
            let f = pool.alloc().unwrap();
            pt.map(
                &mut pool,
                0xF000_0000 + page * PAGE_SIZE,
                f,
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        }
        let va = 0xF000_0000 + PAGE_SIZE - 3;
        pt.write_bytes(&mut pool, va, b"straddle").unwrap();
        let mut buf = [0u8; 8];
        pt.read_bytes(&mut pool, va, &mut buf).unwrap();
        assert_eq!(&buf, b"straddle");
    }

    #[test]
    fn test_string_round_trip() {
        let (mut pool, pt) = setup();
        let f = pool.alloc().unwrap();
        pt.map(&mut pool, 0xD000_0000, f, PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        pt.set_str(&mut pool, 0xD000_0010, "vfs path").unwrap();
        assert_eq!(pt.get_str(&mut pool, 0xD000_0010).unwrap(), "vfs path");
    }

    #[test]
    fn test_stack_push_pop() {
        let (mut pool, pt) = setup();
        let f = pool.alloc().unwrap();
        pt.map(
            &mut pool,
            0xE000_0000 - PAGE_SIZE,
            f,
            PteFlags::WRITABLE | PteFlags::USER,
        )
        .unwrap();
        let mut sp = 0xE000_0000;
        pt.push(&mut pool, &mut sp, 0xDEAD_BEEF_0BAD_F00D).unwrap();
        pt.push(&mut pool, &mut sp, 7).unwrap();
        assert_eq!(sp, 0xE000_0000 - 16);
        assert_eq!(pt.pop(&mut pool, &mut sp).unwrap(), 7);
        assert_eq!(pt.pop(&mut pool, &mut sp).unwrap(), 0xDEAD_BEEF_0BAD_F00D);
    }

    #[test]
    fn test_accessed_flag_set_on_use() {
        let (mut pool, pt) = setup();
        let f = pool.alloc().unwrap();
        pt.map(&mut pool, 0xF000_0000, f, PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        assert!(!pt
            .flags_of(&pool, 0xF000_0000)
            .unwrap()
            .contains(PteFlags::ACCESSED));
        pt.read_u8(&mut pool, 0xF000_0000).unwrap();
        assert!(pt
            .flags_of(&pool, 0xF000_0000)
            .unwrap()
            .contains(PteFlags::ACCESSED));
    }

    #[test]
    fn test_read_only_page_rejects_store() {
        let (mut pool, pt) = setup();
        let f = pool.alloc().unwrap();
        pt.map(&mut pool, 0xC000_0000, f, PteFlags::USER).unwrap();
        assert!(pt.read_u32(&mut pool, 0xC000_0000).is_ok());
        assert_eq!(pt.write_u8(&mut pool, 0xC000_0010, 1), Err(0xC000_0010));
    }

    #[test]
    fn test_memset_and_memcmp() {
        let (mut pool, pt) = setup();
        for page in 0..2u32 {
            let f = pool.alloc().unwrap();
            pt.map(
                &mut pool,
                0xF000_0000 + page * PAGE_SIZE,
                f,
                PteFlags::WRITABLE | PteFlags::USER,
            )
            .unwrap();
        }
        pt.memset(&mut pool, 0xF000_0000, 0x5A, 64).unwrap();
        pt.memset(&mut pool, 0xF000_1000, 0x5A, 64).unwrap();
        assert_eq!(
            pt.memcmp(&mut pool, 0xF000_0000, 0xF000_1000, 64).unwrap(),
            0
        );
        pt.write_u8(&mut pool, 0xF000_1020, 0x00).unwrap();
        assert!(pt.memcmp(&mut pool, 0xF000_0000, 0xF000_1000, 64).unwrap() > 0);
    }
}
