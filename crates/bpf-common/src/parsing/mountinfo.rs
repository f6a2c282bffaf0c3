use std::{
    io::{prelude::*, BufReader},
    path::Path,
};

pub(crate) const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Returns the type of the filesystem mounted on `mount_point`, parsing the
/// given buffer reader. The buffer should contain information about mounts
/// provided by the kernel, which is usually available in `/proc/<pid>/mountinfo`.
/// When the same point has been mounted multiple times, the last mount wins.
///
/// The format of the information is described in
/// [the kernel documentation](https://www.kernel.org/doc/Documentation/filesystems/proc.txt).
/// To sum it up, each line contains the following fields:
///
/// ```ignore
/// 36 35 98:0 /mnt1 /mnt2 rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// (1)(2)(3)   (4)   (5)      (6)      (7)   (8) (9)   (10)         (11)
/// ```
///
/// Field 7 is optional, but might occur multiple times. The purpose of
/// separator `-` is to make it clear where the field 9 starts.
///
/// We are interested only in fields 5 (mount point) and 9 (filesystem type).
pub fn mount_fs_type<R>(reader: BufReader<R>, mount_point: &Path) -> Option<String>
where
    R: Read,
{
    let mut found = None;
    for line in reader.lines().map_while(Result::ok) {
        // Mountinfo is separated by ` - ` into two parts:
        //
        // * Information about the mount which consist of at least 6 fields,
        //   but can contain unknown number of optional fields. The `-`
        //   separator is used due to this uncertainity.
        // * Information about the filesystem.
        let Some((mount_info, filesystem_info)) = line.split_once(" - ") else {
            continue;
        };

        let Some(mountpoint) = mount_info.split_whitespace().nth(4) else {
            continue;
        };
        let Some(filesystem_type) = filesystem_info.split_whitespace().next() else {
            continue;
        };
        if Path::new(mountpoint) == mount_point {
            found = Some(filesystem_type.to_owned());
        }
    }
    found
}
