use pagefs::node::MODE_FILE;
use pagefs::PageFs;

pub fn main() {
    let store = tempfile::NamedTempFile::new()
        .expect("could not create a backing file")
        .into_temp_path();

    let mut fs = PageFs::open_or_create(&store).expect("could not open the store");

    fs.mkdir("/notes", 0o755).unwrap();
    fs.mknod("/notes/today.txt", MODE_FILE | 0o644).unwrap();
    fs.write("/notes/today.txt", b"pages all the way down\n", 0)
        .unwrap();

    let mut buf = [0u8; 64];
    let n = fs.read("/notes/today.txt", &mut buf, 0).unwrap();
    print!("{}", String::from_utf8_lossy(&buf[..n]));

    for name in fs.readdir("/notes").unwrap() {
        let attr = fs.getattr(&format!("/notes/{}", name)).unwrap();
        println!("{}: {} bytes, mode {:o}", name, attr.size, attr.mode);
    }

    fs.sync().unwrap();
}
