#[cfg(test)]
mod tests {
    use std::fs::{File, OpenOptions};
    use std::path::Path;

    use tempfile::TempDir;

    use crate::wal::{LogReader, LogWriter};

    fn create(path: &Path) -> LogWriter {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        LogWriter::new(file)
    }

    fn open_reader(path: &Path) -> LogReader {
        LogReader::new(File::open(path).unwrap(), None, 0)
    }

    fn read_all(reader: &mut LogReader) -> Vec<Vec<u8>> {
        let mut records = Vec::new();
        while let Some(record) = reader.read_record().unwrap() {
            records.push(record);
        }
        records
    }

    #[test]
    fn test_empty_log() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");
        let mut writer = create(&path);
        writer.sync().unwrap();

        let mut reader = open_reader(&path);
        assert!(read_all(&mut reader).is_empty());
    }

    #[test]
    fn test_single_record_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");
        let mut writer = create(&path);
        writer.add_record(b"hello, log").unwrap();
        writer.sync().unwrap();

        let mut reader = open_reader(&path);
        assert_eq!(read_all(&mut reader), vec![b"hello, log".to_vec()]);
    }

    #[test]
    fn test_many_records_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");
        let mut writer = create(&path);

        let records: Vec<Vec<u8>> = (0..100)
            .map(|i| format!("record-{i:03}").into_bytes())
            .collect();
        for record in &records {
            writer.add_record(record).unwrap();
        }
        writer.sync().unwrap();

        let mut reader = open_reader(&path);
        assert_eq!(read_all(&mut reader), records);
    }

    #[test]
    fn test_empty_record_is_valid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");
        let mut writer = create(&path);
        writer.add_record(b"").unwrap();
        writer.add_record(b"after").unwrap();
        writer.sync().unwrap();

        let mut reader = open_reader(&path);
        assert_eq!(read_all(&mut reader), vec![Vec::new(), b"after".to_vec()]);
    }

    #[test]
    fn test_initial_offset_skips_earlier_records() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("000001.log");
        let mut writer = create(&path);
        writer.add_record(b"first").unwrap();
        writer.add_record(b"second").unwrap();
        writer.add_record(b"third").unwrap();
        writer.sync().unwrap();

        // Read everything once to learn the offset of the second record.
        let mut reader = open_reader(&path);
        assert_eq!(reader.read_record().unwrap().unwrap(), b"first");
        assert_eq!(reader.read_record().unwrap().unwrap(), b"second");
        let second_offset = reader.last_record_offset();

        let mut resumed = LogReader::new(File::open(&path).unwrap(), None, second_offset);
        assert_eq!(resumed.read_record().unwrap().unwrap(), b"second");
        assert_eq!(resumed.read_record().unwrap().unwrap(), b"third");
        assert!(resumed.read_record().unwrap().is_none());
    }
}
