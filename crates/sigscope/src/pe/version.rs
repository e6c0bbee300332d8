use pelite::image::VS_FIXEDFILEINFO;
use pelite::resources::version_info::VersionInfo;
use pelite::{pe32, pe64};

/// `a.b.c.d` file version from the image's `VS_FIXEDFILEINFO`, if it carries one
pub(super) fn file_version(bytes: &[u8], is_pe32_plus: bool) -> Option<String> {
    if is_pe32_plus {
        use pe64::Pe;
        let file = pe64::PeFile::from_bytes(bytes).ok()?;
        fixed_version(file.resources().ok()?.version_info().ok()?)
    } else {
        use pe32::Pe;
        let file = pe32::PeFile::from_bytes(bytes).ok()?;
        fixed_version(file.resources().ok()?.version_info().ok()?)
    }
}

fn fixed_version(info: VersionInfo<'_>) -> Option<String> {
    info.fixed().map(format_version)
}

// pelite names the low word of dwFileVersionLS `Build`, so the
// conventional order is major.minor.(LS high).(LS low)
fn format_version(fixed: &VS_FIXEDFILEINFO) -> String {
    let v = &fixed.dwFileVersion;
    format!("{}.{}.{}.{}", v.Major, v.Minor, v.Patch, v.Build)
}
