/// Largest power-of-two downsample factor that keeps the decoded image at
/// least as large as the requested size.
///
/// Returns 1 when the source already fits within the request.
pub fn calculate_sample_size(width: u32, height: u32, req_width: u32, req_height: u32) -> u32 {
    let req_width = req_width.max(1);
    let req_height = req_height.max(1);
    let mut sample_size = 1u32;

    if height > req_height || width > req_width {
        let half_height = height / 2;
        let half_width = width / 2;

        while half_height / sample_size >= req_height && half_width / sample_size >= req_width {
            sample_size *= 2;
        }
    }

    sample_size
}

/// Dimensions after reducing by `sample_size`, never below 1x1.
pub fn sampled_dimensions(width: u32, height: u32, sample_size: u32) -> (u32, u32) {
    let s = sample_size.max(1);
    ((width / s).max(1), (height / s).max(1))
}
