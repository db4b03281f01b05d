#![no_main]

use libfuzzer_sys::fuzz_target;

/// Fuzz target that interprets a byte slice as a sequence of agent
/// operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=malloc, 1=free, 2=realloc, 3=calloc,
///           4=update_access, 5=usable_size)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked pointer to operate on)
///
/// We track up to 64 live pointers.
const MAX_SLOTS: usize = 64;

fuzz_target!(|data: &[u8]| {
    let a = unsafe {
        leakwatch::init::ensure_initialized();
        leakwatch::init::allocator()
    };

    let mut slots: [*mut u8; MAX_SLOTS] = [std::ptr::null_mut(); MAX_SLOTS];
    let mut sizes: [usize; MAX_SLOTS] = [0; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 6;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        i += 4;

        match opcode {
            0 => {
                // malloc
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                }
                let ptr = unsafe { a.malloc(size, 0) };
                assert_eq!(ptr.is_null(), size == 0, "malloc(0) is NULL, otherwise not");
                slots[slot] = ptr;
                sizes[slot] = size;
                if !ptr.is_null() {
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xAA, size.min(256));
                    }
                }
            }
            1 => {
                // free
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                    slots[slot] = std::ptr::null_mut();
                    sizes[slot] = 0;
                }
            }
            2 => {
                // realloc
                if !slots[slot].is_null() {
                    let old_check = sizes[slot].min(size).min(256);
                    let ptr = unsafe { a.realloc(slots[slot], size, 0) };
                    if !ptr.is_null() {
                        // Old contents must have moved with the block.
                        for j in 0..old_check {
                            assert_eq!(unsafe { *ptr.add(j) }, 0xAA);
                        }
                        slots[slot] = ptr;
                        sizes[slot] = size;
                    } else {
                        // realloc(p, 0) freed the block.
                        assert_eq!(size, 0);
                        slots[slot] = std::ptr::null_mut();
                        sizes[slot] = 0;
                    }
                } else {
                    let ptr = unsafe { a.realloc(std::ptr::null_mut(), size, 0) };
                    slots[slot] = ptr;
                    sizes[slot] = size;
                    if !ptr.is_null() {
                        unsafe {
                            std::ptr::write_bytes(ptr, 0xAA, size.min(256));
                        }
                    }
                }
            }
            3 => {
                // calloc
                if !slots[slot].is_null() {
                    unsafe { a.free(slots[slot]) };
                }
                let nmemb = (size >> 8).max(1);
                let elem_size = (size & 0xFF).max(1);
                let ptr = unsafe { a.calloc(nmemb, elem_size, 0) };
                let total = nmemb * elem_size;
                slots[slot] = ptr;
                sizes[slot] = total;
                if !ptr.is_null() {
                    let check_len = total.min(256);
                    for j in 0..check_len {
                        assert_eq!(
                            unsafe { *ptr.add(j) },
                            0,
                            "calloc memory not zeroed at offset {}",
                            j
                        );
                    }
                    unsafe {
                        std::ptr::write_bytes(ptr, 0xAA, check_len);
                    }
                }
            }
            4 => {
                // update_access: idempotent, fine on live and null pointers
                unsafe { a.update_access(slots[slot]) };
            }
            5 => {
                // usable_size reports exactly the requested size
                if !slots[slot].is_null() {
                    assert_eq!(unsafe { a.usable_size(slots[slot]) }, sizes[slot]);
                }
            }
            _ => unreachable!(),
        }
    }

    // Cleanup
    for slot in &mut slots {
        if !slot.is_null() {
            unsafe { a.free(*slot) };
            *slot = std::ptr::null_mut();
        }
    }
});
