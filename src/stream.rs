//! Little-endian binary plumbing shared by the wire messages and the
//! snapshot codec.

use std::io::{Read, Result, Write};

/// Sequential little-endian writer over any [`Write`] sink.
pub struct BinaryWriter<W: Write> {
    inner: W,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.inner.write_all(&[v])
    }

    pub fn put_i8(&mut self, v: i8) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    pub fn put_bool(&mut self, v: bool) -> Result<()> {
        self.put_u8(v as u8)
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    pub fn put_i32(&mut self, v: i32) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.inner.write_all(&v.to_le_bytes())
    }
}

/// Sequential little-endian reader over any [`Read`] source.
pub struct BinaryReader<R: Read> {
    inner: R,
}

impl<R: Read> BinaryReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn fill<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.fill::<1>()?[0])
    }

    pub fn get_i8(&mut self) -> Result<i8> {
        Ok(i8::from_le_bytes(self.fill::<1>()?))
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.fill::<4>()?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.fill::<4>()?))
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.fill::<8>()?))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let mut writer = BinaryWriter::new(Vec::new());
        writer.put_u8(7).unwrap();
        writer.put_i8(-3).unwrap();
        writer.put_bool(true).unwrap();
        writer.put_u32(0xdead_beef).unwrap();
        writer.put_i32(-123_456).unwrap();
        writer.put_u64(u64::MAX - 1).unwrap();
        let bytes = writer.into_inner();

        let mut reader = BinaryReader::new(bytes.as_slice());
        assert_eq!(reader.get_u8().unwrap(), 7);
        assert_eq!(reader.get_i8().unwrap(), -3);
        assert!(reader.get_bool().unwrap());
        assert_eq!(reader.get_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.get_i32().unwrap(), -123_456);
        assert_eq!(reader.get_u64().unwrap(), u64::MAX - 1);
        assert!(reader.get_u8().is_err());
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = BinaryWriter::new(Vec::new());
        writer.put_u32(1).unwrap();
        assert_eq!(writer.into_inner(), vec![1, 0, 0, 0]);
    }
}
