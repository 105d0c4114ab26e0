// 24-series I2C EEPROM access for the 0xBA/0xBB vendor requests.

use embedded_hal::i2c::I2c;

use crate::config::{EEPROM_MAX_TRANSFER, EEPROM_PAGE_SIZE, EEPROM_WRITE_POLL_LIMIT};
use crate::error::EepromError;
use crate::log::{debug, warn};

pub struct Eeprom<I> {
    i2c: I,
}

impl<I: I2c> Eeprom<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    pub fn read(&mut self, addr: u8, offset: u16, buf: &mut [u8]) -> Result<(), EepromError> {
        if buf.len() > EEPROM_MAX_TRANSFER {
            return Err(EepromError::TooLong);
        }
        debug!("EEPROM {=u8:#x} read {} @ {=u16:#x}", addr, buf.len(), offset);
        self.i2c
            .write_read(addr, &offset.to_be_bytes(), buf)
            .map_err(|_| EepromError::Bus)
    }

    /// Page-split write; each page is followed by acknowledge polling.
    pub fn write(&mut self, addr: u8, offset: u16, data: &[u8]) -> Result<(), EepromError> {
        if data.len() > EEPROM_MAX_TRANSFER {
            return Err(EepromError::TooLong);
        }
        debug!("EEPROM {=u8:#x} write {} @ {=u16:#x}", addr, data.len(), offset);

        let mut frame = [0u8; 2 + EEPROM_PAGE_SIZE];
        let mut pos = offset;
        let mut rest = data;
        while !rest.is_empty() {
            let room = EEPROM_PAGE_SIZE - (pos as usize % EEPROM_PAGE_SIZE);
            let (page, tail) = rest.split_at(room.min(rest.len()));

            frame[..2].copy_from_slice(&pos.to_be_bytes());
            frame[2..2 + page.len()].copy_from_slice(page);
            self.i2c
                .write(addr, &frame[..2 + page.len()])
                .map_err(|_| EepromError::Bus)?;
            self.wait_write_cycle(addr)?;

            pos = pos.wrapping_add(page.len() as u16);
            rest = tail;
        }
        Ok(())
    }

    fn wait_write_cycle(&mut self, addr: u8) -> Result<(), EepromError> {
        let mut probe = [0u8; 1];
        for _ in 0..EEPROM_WRITE_POLL_LIMIT {
            if self.i2c.read(addr, &mut probe).is_ok() {
                return Ok(());
            }
        }
        warn!("EEPROM {=u8:#x} write cycle never finished", addr);
        Err(EepromError::WriteTimeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockI2c;

    #[test]
    fn write_splits_on_page_boundaries() {
        let i2c = MockI2c::default();
        let mut ee = Eeprom::new(i2c.clone());
        let data: Vec<u8> = (0..100u8).collect();

        ee.write(0x51, 0x0030, &data).unwrap();

        let writes = i2c.writes();
        assert_eq!(writes.len(), 3);
        // 0x30..0x40, 0x40..0x80, 0x80..0x94
        assert_eq!(writes[0].0, 0x51);
        assert_eq!(&writes[0].1[..2], &[0x00, 0x30]);
        assert_eq!(writes[0].1.len(), 2 + 16);
        assert_eq!(&writes[1].1[..2], &[0x00, 0x40]);
        assert_eq!(writes[1].1.len(), 2 + 64);
        assert_eq!(&writes[2].1[..2], &[0x00, 0x80]);
        assert_eq!(writes[2].1.len(), 2 + 20);
        assert_eq!(writes[2].1[2], 80);
        assert_eq!(i2c.memory(0x0093), 99);
    }

    #[test]
    fn read_sends_big_endian_address() {
        let i2c = MockI2c::default();
        let mut ee = Eeprom::new(i2c.clone());
        ee.write(0x50, 0x0102, &[0xAA, 0xBB]).unwrap();

        let mut buf = [0u8; 2];
        ee.read(0x50, 0x0102, &mut buf).unwrap();
        assert_eq!(buf, [0xAA, 0xBB]);
    }

    #[test]
    fn ack_poll_retries_until_device_answers() {
        let i2c = MockI2c::default();
        i2c.nack_polls(3);
        let mut ee = Eeprom::new(i2c.clone());
        ee.write(0x50, 0, &[1]).unwrap();
        assert_eq!(i2c.poll_count(), 4);
    }

    #[test]
    fn ack_poll_gives_up() {
        let i2c = MockI2c::default();
        i2c.nack_polls(u32::MAX);
        let mut ee = Eeprom::new(i2c);
        assert_eq!(ee.write(0x50, 0, &[1]), Err(EepromError::WriteTimeout));
    }

    #[test]
    fn oversized_transfer_rejected() {
        let mut ee = Eeprom::new(MockI2c::default());
        let big = vec![0u8; EEPROM_MAX_TRANSFER + 1];
        assert_eq!(ee.write(0x50, 0, &big), Err(EepromError::TooLong));
    }
}
