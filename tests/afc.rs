#![cfg(feature = "afc")]

mod common;

use std::io::SeekFrom;

use devicelink::{
    DeviceError, ErrorKind,
    afc::{
        AfcClient,
        errors::AfcError,
        opcode::{AfcFopenMode, AfcOpcode, LinkType},
        packet::AfcPacketHeader,
    },
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn client() -> (
    AfcClient,
    std::sync::Arc<std::sync::Mutex<common::afc_server::Stats>>,
) {
    common::init_tracing();
    let (connection, device) = common::connection("afc-test");
    let stats = common::afc_server::spawn(device, false);
    (AfcClient::new(connection), stats)
}

#[tokio::test]
async fn list_dir_hides_dot_entries() {
    let (mut afc, _) = client();
    let mut root = afc.list_dir("/").await.unwrap();
    root.sort();
    assert_eq!(root, vec!["DCIM", "Downloads"]);
    assert_eq!(
        afc.list_dir("/DCIM/100APPLE").await.unwrap(),
        vec!["IMG_0001.JPG"]
    );
    assert!(afc.list_dir("/Downloads").await.unwrap().is_empty());
}

#[tokio::test]
async fn packet_numbers_increase_per_request() {
    let (mut afc, stats) = client();
    afc.list_dir("/").await.unwrap();
    afc.mk_dir("/Downloads/a").await.unwrap();
    afc.get_device_info().await.unwrap();
    assert_eq!(stats.lock().unwrap().packet_numbers, vec![0, 1, 2]);
}

#[tokio::test]
async fn status_errors_carry_kind() {
    let (mut afc, _) = client();

    let err = afc.list_dir("/nope").await.unwrap_err();
    assert!(matches!(err, DeviceError::Afc(AfcError::ObjectNotFound)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.code(), -33);

    afc.mk_dir("/Downloads/new").await.unwrap();
    let err = afc.mk_dir("/Downloads/new").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);

    // an error does not poison the connection
    assert!(afc.list_dir("/Downloads").await.unwrap().contains(&"new".to_string()));
}

#[tokio::test]
async fn file_info_for_files_dirs_and_links() {
    let (mut afc, _) = client();

    let info = afc
        .get_file_info("/DCIM/100APPLE/IMG_0001.JPG")
        .await
        .unwrap();
    assert_eq!(info.size, 1234);
    assert_eq!(info.blocks, 3);
    assert_eq!(info.st_ifmt, "S_IFREG");
    assert_eq!(info.st_nlink, "1");
    assert_eq!(info.modified.and_utc().timestamp(), 1_700_000_000);
    assert_eq!(info.creation.and_utc().timestamp(), 1_600_000_000);
    assert!(info.st_link_target.is_none());

    assert_eq!(afc.get_file_info("/DCIM").await.unwrap().st_ifmt, "S_IFDIR");

    afc.link("/DCIM/100APPLE/IMG_0001.JPG", "/Downloads/latest", LinkType::Symlink)
        .await
        .unwrap();
    let info = afc.get_file_info("/Downloads/latest").await.unwrap();
    assert_eq!(info.st_ifmt, "S_IFLNK");
    assert_eq!(
        info.st_link_target.as_deref(),
        Some("/DCIM/100APPLE/IMG_0001.JPG")
    );
}

#[tokio::test]
async fn device_info_is_parsed() {
    let (mut afc, _) = client();
    let info = afc.get_device_info().await.unwrap();
    assert_eq!(info.model, "iPhone14,2");
    assert_eq!(info.total_bytes, 64_000_000_000);
    assert_eq!(info.free_bytes, 12_000_000_000);
    assert_eq!(info.block_size, 4096);
}

#[tokio::test]
async fn large_write_is_chunked_and_reads_back() {
    let (mut afc, stats) = client();
    let data = (0..150 * 1024).map(|i| (i % 251) as u8).collect::<Vec<_>>();

    let mut file = afc
        .open("/Downloads/blob.bin", AfcFopenMode::WrOnly)
        .await
        .unwrap();
    file.write(&data).await.unwrap();
    file.close().await.unwrap();
    assert_eq!(
        stats.lock().unwrap().write_chunks,
        vec![64 * 1024, 64 * 1024, 22 * 1024]
    );

    let mut file = afc
        .open("/Downloads/blob.bin", AfcFopenMode::RdOnly)
        .await
        .unwrap();
    let read = file.read_entire().await.unwrap();
    file.close().await.unwrap();
    assert_eq!(read.len(), data.len());
    assert!(read == data);

    assert_eq!(
        afc.get_file_info("/Downloads/blob.bin").await.unwrap().size,
        data.len()
    );
    assert_eq!(afc.open_file_count(), 0);
}

#[tokio::test]
async fn seek_tell_and_short_reads() {
    let (mut afc, _) = client();
    let mut file = afc
        .open("/Downloads/abc.txt", AfcFopenMode::Rw)
        .await
        .unwrap();
    file.write(b"abcdefghij").await.unwrap();
    assert_eq!(file.tell().await.unwrap(), 10);

    assert_eq!(file.seek(SeekFrom::Start(2)).await.unwrap(), 2);
    assert_eq!(file.read(3).await.unwrap(), b"cde");
    assert_eq!(file.seek(SeekFrom::Current(1)).await.unwrap(), 6);
    assert_eq!(file.seek(SeekFrom::End(-2)).await.unwrap(), 8);

    // asking past the end returns what is there, then nothing
    assert_eq!(file.read(100).await.unwrap(), b"ij");
    assert!(file.read(100).await.unwrap().is_empty());

    let err = file.seek(SeekFrom::Current(-100)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    file.close().await.unwrap();
}

#[tokio::test]
async fn append_mode_starts_at_end() {
    let (mut afc, _) = client();
    let mut file = afc.open("/Downloads/log", AfcFopenMode::WrOnly).await.unwrap();
    file.write(b"one\n").await.unwrap();
    file.close().await.unwrap();

    let mut file = afc.open("/Downloads/log", AfcFopenMode::Append).await.unwrap();
    assert_eq!(file.tell().await.unwrap(), 4);
    file.write(b"two\n").await.unwrap();
    file.close().await.unwrap();

    let mut file = afc.open("/Downloads/log", AfcFopenMode::RdOnly).await.unwrap();
    assert_eq!(file.read_entire().await.unwrap(), b"one\ntwo\n");
    file.close().await.unwrap();
}

#[tokio::test]
async fn open_missing_file_read_only_fails() {
    let (mut afc, _) = client();
    let err = afc
        .open("/Downloads/missing", AfcFopenMode::RdOnly)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(afc.open_file_count(), 0);
}

#[tokio::test]
async fn writing_into_read_only_tree_is_denied() {
    let (mut afc, _) = client();
    let photo = "/DCIM/100APPLE/IMG_0001.JPG";

    let err = afc.open(photo, AfcFopenMode::WrOnly).await.unwrap_err();
    assert!(matches!(err, DeviceError::Afc(AfcError::PermDenied)));
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    assert_eq!(afc.open_file_count(), 0);

    let err = afc.open(photo, AfcFopenMode::Append).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    let err = afc.mk_dir("/DCIM/101APPLE").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PermissionDenied);

    // reading is still allowed and the file is untouched
    let mut file = afc.open(photo, AfcFopenMode::RdOnly).await.unwrap();
    assert_eq!(file.read_entire().await.unwrap().len(), 1234);
    file.close().await.unwrap();
}

#[tokio::test]
async fn directory_lifecycle() {
    let (mut afc, _) = client();
    let dir = "/Downloads/album";

    afc.mk_dir(dir).await.unwrap();
    assert!(afc.list_dir(dir).await.unwrap().is_empty());
    assert_eq!(afc.get_file_info(dir).await.unwrap().st_ifmt, "S_IFDIR");

    afc.remove_all(dir).await.unwrap();
    let err = afc.get_file_info(dir).await.unwrap_err();
    assert!(matches!(err, DeviceError::Afc(AfcError::ObjectNotFound)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn oversized_reply_is_an_error() {
    common::init_tracing();
    let (connection, mut device) = common::connection("afc-test");
    let mut afc = AfcClient::new(connection);
    tokio::spawn(async move {
        let mut header = [0u8; AfcPacketHeader::LEN as usize];
        device.read_exact(&mut header).await.unwrap();
        let header = AfcPacketHeader::parse(&header).unwrap();
        let mut rest = vec![0u8; (header.entire_len - AfcPacketHeader::LEN) as usize];
        device.read_exact(&mut rest).await.unwrap();

        let reply = AfcPacketHeader {
            magic: devicelink::afc::MAGIC,
            entire_len: u64::MAX,
            header_payload_len: AfcPacketHeader::LEN,
            packet_num: header.packet_num,
            operation: AfcOpcode::Data,
        };
        device.write_all(&reply.serialize()).await.unwrap();
        // keep the device end open until the client gives up
        let mut sink = Vec::new();
        let _ = device.read_to_end(&mut sink).await;
    });

    let err = afc.list_dir("/").await.unwrap_err();
    assert!(matches!(err, DeviceError::PacketSizeMismatch));
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[tokio::test]
async fn rename_remove_and_remove_all() {
    let (mut afc, _) = client();
    afc.mk_dir("/Downloads/tree").await.unwrap();
    afc.mk_dir("/Downloads/tree/inner").await.unwrap();
    let mut f = afc
        .open("/Downloads/tree/inner/f", AfcFopenMode::WrOnly)
        .await
        .unwrap();
    f.write(b"x").await.unwrap();
    f.close().await.unwrap();

    let err = afc.remove("/Downloads/tree").await.unwrap_err();
    assert!(matches!(err, DeviceError::Afc(AfcError::DirNotEmpty)));

    afc.rename("/Downloads/tree", "/Downloads/moved").await.unwrap();
    assert_eq!(afc.list_dir("/Downloads/moved/inner").await.unwrap(), vec!["f"]);
    assert_eq!(
        afc.list_dir("/Downloads/tree").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );

    afc.remove("/Downloads/moved/inner/f").await.unwrap();
    afc.remove_all("/Downloads/moved").await.unwrap();
    assert!(afc.list_dir("/Downloads").await.unwrap().is_empty());
}

#[tokio::test]
async fn close_closes_forgotten_descriptors() {
    let (mut afc, stats) = client();
    let file = afc
        .open("/Downloads/leak", AfcFopenMode::WrOnly)
        .await
        .unwrap();
    let fd = file.fd();
    drop(file);
    assert_eq!(afc.open_file_count(), 1);

    let closed = afc.close().await.unwrap();
    assert_eq!(closed, 1);

    let stats = stats.lock().unwrap();
    assert_eq!(stats.closed_fds, vec![fd]);
    assert_eq!(stats.requests.last(), Some(&AfcOpcode::FileClose));
}

#[tokio::test]
async fn closed_client_connection_rejects_requests() {
    let (mut afc, _) = client();
    afc.connection.close().await.unwrap();
    let err = afc.list_dir("/").await.unwrap_err();
    assert!(matches!(err, DeviceError::NoEstablishedConnection));
    assert_eq!(err.kind(), ErrorKind::Transport);
}
